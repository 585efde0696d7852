//! File and tensor record headers
//!
//! Reading performs full validation: a header that reads successfully is a
//! header the rest of the engine can trust.

use crate::error::{RecordarError, Result};
use crate::format::io::{read_u32, write_u32};
use crate::format::types::{
    TensorType, FILE_MAGIC, FILE_VERSION_MAX, FILE_VERSION_MIN, QUANTIZED_FILE_VERSION, TYPE_COUNT,
};
use std::io::{Read, Write};

/// The fixed 24-byte file header
///
/// The magic number is validated on read and written as a constant; it is
/// not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version, in `FILE_VERSION_MIN..=FILE_VERSION_MAX`
    pub version: u32,
    /// Vocabulary size `V`
    pub n_vocab: u32,
    /// Embedding width `E`
    pub n_embed: u32,
    /// Layer count `L`
    pub n_layer: u32,
    /// Data type of the 2-D weight matrices
    pub data_type: TensorType,
}

impl FileHeader {
    /// Read and validate a file header.
    ///
    /// # Errors
    ///
    /// `FileMagic` on a magic mismatch, `FileVersion` for versions outside
    /// the supported range, `DataType` for out-of-range codes, removed
    /// formats, and quantized payloads at the wrong version.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = read_u32(reader, "file magic")?;
        if magic != FILE_MAGIC {
            return Err(RecordarError::FileMagic {
                actual: magic,
                expected: FILE_MAGIC,
            });
        }

        let version = read_u32(reader, "file version")?;
        if !(FILE_VERSION_MIN..=FILE_VERSION_MAX).contains(&version) {
            return Err(RecordarError::FileVersion {
                version,
                min: FILE_VERSION_MIN,
                max: FILE_VERSION_MAX,
            });
        }

        let n_vocab = read_u32(reader, "vocabulary size")?;
        let n_embed = read_u32(reader, "embedding width")?;
        let n_layer = read_u32(reader, "layer count")?;
        let data_type = read_data_type(reader, "model")?;

        if data_type.is_quantized() && version != QUANTIZED_FILE_VERSION {
            return Err(RecordarError::DataType {
                reason: format!(
                    "quantized model files in {data_type} format must be version \
                     {QUANTIZED_FILE_VERSION}, found {version}; requantize the model"
                ),
            });
        }

        Ok(Self {
            version,
            n_vocab,
            n_embed,
            n_layer,
            data_type,
        })
    }

    /// Write the 24-byte header, magic included.
    ///
    /// # Errors
    ///
    /// `FileWrite` if the writer fails.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_u32(writer, FILE_MAGIC, "file magic")?;
        write_u32(writer, self.version, "file version")?;
        write_u32(writer, self.n_vocab, "vocabulary size")?;
        write_u32(writer, self.n_embed, "embedding width")?;
        write_u32(writer, self.n_layer, "layer count")?;
        write_u32(writer, self.data_type.code(), "model data type")
    }
}

/// Header of one tensor record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorHeader {
    /// 1 for vectors, 2 for matrices
    pub dim_count: u32,
    /// Length in bytes of the key that follows the header
    pub key_length: u32,
    /// Payload data type
    pub data_type: TensorType,
    /// Row length in elements
    pub width: u32,
    /// Row count; 1 for vectors (implied, not stored on disk)
    pub height: u32,
}

impl TensorHeader {
    /// Read and validate a tensor record header.
    ///
    /// `height` is read from disk only when `dim_count == 2`.
    ///
    /// # Errors
    ///
    /// `Shape` for dimension counts other than 1 or 2, `DataType` for
    /// out-of-range codes and removed formats, `FileRead` on I/O failure.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let dim_count = read_u32(reader, "tensor dimension count")?;
        let key_length = read_u32(reader, "tensor key length")?;
        let data_type_code = read_u32(reader, "tensor data type")?;
        let width = read_u32(reader, "tensor width")?;

        if dim_count != 1 && dim_count != 2 {
            return Err(RecordarError::Shape {
                reason: format!("tensor has an invalid shape ({dim_count} dimensions)"),
            });
        }

        let data_type = decode_tensor_type(data_type_code, "tensor")?;

        let height = if dim_count == 2 {
            read_u32(reader, "tensor height")?
        } else {
            1
        };

        Ok(Self {
            dim_count,
            key_length,
            data_type,
            width,
            height,
        })
    }

    /// Write the record header; `height` is emitted only for matrices.
    ///
    /// # Errors
    ///
    /// `FileWrite` if the writer fails.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_u32(writer, self.dim_count, "tensor dimension count")?;
        write_u32(writer, self.key_length, "tensor key length")?;
        write_u32(writer, self.data_type.code(), "tensor data type")?;
        write_u32(writer, self.width, "tensor width")?;
        if self.dim_count == 2 {
            write_u32(writer, self.height, "tensor height")?;
        }
        Ok(())
    }

    /// Element count of the payload.
    #[must_use]
    pub fn element_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn payload_bytes(&self) -> u64 {
        self.data_type
            .payload_bytes(u64::from(self.width), u64::from(self.height))
    }

    /// Bytes between the end of this header and the next record: the key
    /// plus the payload. Used by the sizing pass to skip records.
    #[must_use]
    pub fn key_and_payload_bytes(&self) -> u64 {
        u64::from(self.key_length) + self.payload_bytes()
    }

    /// Total on-disk size of the record: header, key, payload.
    ///
    /// The header itself is 16 bytes for vectors and 20 for matrices, since
    /// `height` is stored only when `dim_count == 2`.
    #[must_use]
    pub fn record_bytes(&self) -> u64 {
        let header_bytes: u64 = if self.dim_count == 2 { 20 } else { 16 };
        header_bytes + self.key_and_payload_bytes()
    }
}

fn read_data_type<R: Read>(reader: &mut R, kind: &'static str) -> Result<TensorType> {
    let code = read_u32(reader, "data type code")?;
    decode_tensor_type(code, kind)
}

fn decode_tensor_type(code: u32, kind: &'static str) -> Result<TensorType> {
    let Some(data_type) = TensorType::from_code(code) else {
        return Err(RecordarError::DataType {
            reason: format!(
                "{kind} data type out of range ({code} > {})",
                TYPE_COUNT - 1
            ),
        });
    };

    if data_type.is_removed() {
        return Err(RecordarError::DataType {
            reason: format!(
                "{kind} data in {data_type} format can no longer be loaded because the \
                 format was removed; requantize the model into a supported format"
            ),
        });
    }

    Ok(data_type)
}
