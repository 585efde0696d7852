//! Error types for Recordar
//!
//! One crate-wide error enum; every fallible operation returns [`Result`].
//! Variants follow the failure categories of the model pipeline: file I/O,
//! container format, tensor semantics, model schema, capacity, graph
//! construction, and caller arguments.

use thiserror::Error;

/// Result type alias for Recordar operations
pub type Result<T> = std::result::Result<T, RecordarError>;

/// Error type for all Recordar operations
#[derive(Error, Debug)]
pub enum RecordarError {
    /// Failed to open a model file
    #[error("failed to open {path}: {source}")]
    FileOpen {
        /// Path that could not be opened
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Failed to stat a model file
    #[error("failed to stat {path}: {source}")]
    FileStat {
        /// Path that could not be inspected
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A read from the model file failed or hit EOF early
    #[error("failed to read {what}: {source}")]
    FileRead {
        /// What was being read
        what: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A write to the output file failed
    #[error("failed to write {what}: {source}")]
    FileWrite {
        /// What was being written
        what: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A seek over the model file failed
    #[error("failed to seek past {what}: {source}")]
    FileSeek {
        /// What was being skipped
        what: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The file does not start with the expected magic number
    #[error("invalid magic 0x{actual:08X}, expected 0x{expected:08X}")]
    FileMagic {
        /// Magic value found in the file
        actual: u32,
        /// Magic value the format requires
        expected: u32,
    },

    /// The file version is outside the supported range
    #[error("unsupported file version {version}, supported range is {min}..={max}")]
    FileVersion {
        /// Version found in the file
        version: u32,
        /// Oldest supported version
        min: u32,
        /// Newest supported version
        max: u32,
    },

    /// Unknown, removed, or otherwise unusable data type
    #[error("bad data type: {reason}")]
    DataType {
        /// Why the data type cannot be used
        reason: String,
    },

    /// A tensor has an invalid shape
    #[error("invalid shape: {reason}")]
    Shape {
        /// Reason for invalidity
        reason: String,
    },

    /// A tensor dimension does not match the model header
    #[error("dimension mismatch for {name}: expected {expected}, got {actual}")]
    Dimension {
        /// Parameter name
        name: String,
        /// Expected extent
        expected: usize,
        /// Extent found in the file
        actual: usize,
    },

    /// The quantizer was given a source it cannot convert
    #[error("unsupported source data type {actual}; needs to be f32 or f16")]
    UnsupportedSource {
        /// Source type name
        actual: String,
    },

    /// A parameter required by the model schema is missing
    #[error("model is missing parameter {name}")]
    ParamMissing {
        /// Schema name of the missing parameter
        name: String,
    },

    /// A planned capacity was exceeded or a resource could not be obtained
    #[error("capacity exceeded: {reason}")]
    Capacity {
        /// What ran out
        reason: String,
    },

    /// The computation graph could not be built
    #[error("graph construction failed: {reason}")]
    Graph {
        /// Why the build failed
        reason: String,
    },

    /// A caller-supplied argument is invalid
    #[error("invalid argument: {reason}")]
    Args {
        /// Which argument and why
        reason: String,
    },
}

impl RecordarError {
    /// Shorthand for a [`RecordarError::FileRead`] wrapping an I/O error.
    pub(crate) fn read(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::FileRead {
            what: what.into(),
            source,
        }
    }

    /// Shorthand for a [`RecordarError::FileWrite`] wrapping an I/O error.
    pub(crate) fn write(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::FileWrite {
            what: what.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_display() {
        let err = RecordarError::FileMagic {
            actual: 0xDEAD_BEEF,
            expected: 0x6767_6D66,
        };
        assert!(err.to_string().contains("0xDEADBEEF"));
        assert!(err.to_string().contains("0x67676D66"));
    }

    #[test]
    fn test_version_display() {
        let err = RecordarError::FileVersion {
            version: 99,
            min: 100,
            max: 101,
        };
        assert!(err.to_string().contains("99"));
        assert!(err.to_string().contains("100..=101"));
    }

    #[test]
    fn test_param_missing_display() {
        let err = RecordarError::ParamMissing {
            name: "blocks.0.ffn.key.weight".to_string(),
        };
        assert!(err.to_string().contains("blocks.0.ffn.key.weight"));
    }
}
