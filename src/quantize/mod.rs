//! Model file requantization
//!
//! Streams a full- or half-precision model file tensor by tensor, rewriting
//! every eligible 2-D weight matrix into a target data type and passing
//! everything else through bit-identical. A tensor is eligible exactly when
//! its own type is F32 or F16, it is two-dimensional, and it is neither the
//! embedding nor the head matrix (those two stay in full precision because
//! they bracket the network and quantization there costs the most quality).
//!
//! The converter reuses three buffers across tensors (payload bytes,
//! decoded f32 values, converted bytes) and swaps the byte buffers instead
//! of copying. Reports are returned as data; rendering is the caller's
//! business.

pub mod blocks;

use crate::error::{RecordarError, Result};
use crate::format::{
    read_bytes, read_into, write_bytes, FileHeader, TensorHeader, TensorType, FILE_VERSION,
    QUANTIZED_FILE_VERSION,
};
use crate::quantize::blocks::HISTOGRAM_BUCKETS;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// What happened to one tensor during requantization
#[derive(Debug, Clone)]
pub struct TensorReport {
    /// Tensor key, decoded lossily for display
    pub name: String,
    /// Row length in elements
    pub width: u32,
    /// Row count
    pub height: u32,
    /// Type the tensor had in the source file
    pub source_type: TensorType,
    /// Type written to the output file
    pub output_type: TensorType,
    /// Payload bytes in the source file
    pub original_bytes: u64,
    /// Payload bytes in the output file
    pub new_bytes: u64,
    /// Code histogram; present only for block-quantized conversions
    pub histogram: Option<[i64; HISTOGRAM_BUCKETS]>,
}

impl TensorReport {
    /// Whether this tensor was converted (rather than passed through).
    #[must_use]
    pub fn converted(&self) -> bool {
        self.source_type != self.output_type || self.histogram.is_some()
    }
}

/// Totals of a requantization run
#[derive(Debug, Clone)]
pub struct QuantizeSummary {
    /// Target type of the run
    pub target: TensorType,
    /// Total payload bytes read
    pub original_bytes: u64,
    /// Total payload bytes written
    pub new_bytes: u64,
    /// Aggregate code histogram over all block-quantized tensors
    pub histogram: [i64; HISTOGRAM_BUCKETS],
    /// Per-tensor reports, in file order
    pub tensors: Vec<TensorReport>,
}

impl QuantizeSummary {
    /// Original size over new size.
    #[must_use]
    pub fn compression_ratio(&self) -> f64 {
        if self.new_bytes == 0 {
            return 0.0;
        }
        self.original_bytes as f64 / self.new_bytes as f64
    }
}

/// Tensors excluded from quantization by name.
const EXCLUDED_NAMES: [&[u8]; 2] = [b"emb.weight", b"head.weight"];

/// Rewrite `input_path` into `output_path` with eligible matrices converted
/// to `target`.
///
/// The output header carries the target type and the version that type
/// demands: the legacy quantized version for block targets, the current
/// version otherwise. On failure the partially written output file is left
/// behind for inspection and an error is returned.
///
/// # Errors
///
/// `DataType` for removed targets, `UnsupportedSource` when the source file
/// is not F32/F16, plus file and format errors.
pub fn quantize_file(
    input_path: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    target: TensorType,
) -> Result<QuantizeSummary> {
    if target.is_removed() {
        return Err(RecordarError::DataType {
            reason: format!("invalid target data type ({target}): the format was removed"),
        });
    }

    let input_path = input_path.as_ref();
    let input = File::open(input_path).map_err(|e| RecordarError::FileOpen {
        path: input_path.display().to_string(),
        source: e,
    })?;
    let input_len = input
        .metadata()
        .map_err(|e| RecordarError::FileStat {
            path: input_path.display().to_string(),
            source: e,
        })?
        .len();
    let mut reader = BufReader::new(input);

    let output_path = output_path.as_ref();
    let output = File::create(output_path).map_err(|e| RecordarError::FileOpen {
        path: output_path.display().to_string(),
        source: e,
    })?;
    let mut writer = BufWriter::new(output);

    let mut header = FileHeader::read(&mut reader)?;
    if !matches!(header.data_type, TensorType::F32 | TensorType::F16) {
        return Err(RecordarError::UnsupportedSource {
            actual: header.data_type.name().to_string(),
        });
    }

    header.version = if target.is_quantized() {
        QUANTIZED_FILE_VERSION
    } else {
        FILE_VERSION
    };
    header.data_type = target;
    header.write(&mut writer)?;

    let mut summary = QuantizeSummary {
        target,
        original_bytes: 0,
        new_bytes: 0,
        histogram: [0; HISTOGRAM_BUCKETS],
        tensors: Vec::new(),
    };

    // Reused across tensors; capacity only grows.
    let mut payload: Vec<u8> = Vec::new();
    let mut converted: Vec<u8> = Vec::new();
    let mut values: Vec<f32> = Vec::new();

    let mut pos = 24u64;
    while pos < input_len {
        let tensor_header = TensorHeader::read(&mut reader)?;
        let key = read_bytes(&mut reader, tensor_header.key_length as usize, "tensor name")?;

        let original_bytes = tensor_header.payload_bytes();
        let payload_len = usize::try_from(original_bytes).map_err(|_| RecordarError::Shape {
            reason: "tensor payload exceeds addressable memory".to_string(),
        })?;
        payload.resize(payload_len, 0);
        read_into(&mut reader, &mut payload, "tensor data")?;

        pos += tensor_header.record_bytes();

        let eligible = matches!(
            tensor_header.data_type,
            TensorType::F32 | TensorType::F16
        ) && tensor_header.dim_count == 2
            && !EXCLUDED_NAMES.contains(&key.as_slice());

        let mut out_header = tensor_header;
        let mut histogram = None;

        if eligible {
            if target.is_quantized() && tensor_header.width as usize % blocks::BLOCK_SIZE != 0 {
                return Err(RecordarError::Shape {
                    reason: format!(
                        "cannot quantize {}: width {} is not a multiple of {}",
                        String::from_utf8_lossy(&key),
                        tensor_header.width,
                        blocks::BLOCK_SIZE
                    ),
                });
            }

            let elements = usize::try_from(tensor_header.element_count()).map_err(|_| {
                RecordarError::Shape {
                    reason: "tensor element count exceeds addressable memory".to_string(),
                }
            })?;
            values.resize(elements, 0.0);
            match tensor_header.data_type {
                TensorType::F32 => blocks::f32_row_from_bytes(&payload, &mut values)?,
                _ => blocks::f16_row_to_f32(&payload, &mut values)?,
            }

            let mut hist_cur = [0i64; HISTOGRAM_BUCKETS];
            blocks::quantize_row(target, &values, &mut converted, &mut hist_cur)?;
            std::mem::swap(&mut payload, &mut converted);

            out_header.data_type = target;
            if target.is_quantized() {
                for (total, cur) in summary.histogram.iter_mut().zip(&hist_cur) {
                    *total += cur;
                }
                histogram = Some(hist_cur);
            }
        }

        out_header.write(&mut writer)?;
        write_bytes(&mut writer, &key, "tensor name")?;
        write_bytes(&mut writer, &payload, "tensor data")?;

        let new_bytes = payload.len() as u64;
        summary.original_bytes += original_bytes;
        summary.new_bytes += new_bytes;
        summary.tensors.push(TensorReport {
            name: String::from_utf8_lossy(&key).into_owned(),
            width: tensor_header.width,
            height: tensor_header.height,
            source_type: tensor_header.data_type,
            output_type: out_header.data_type,
            original_bytes,
            new_bytes,
            histogram,
        });
    }

    writer
        .flush()
        .map_err(|e| RecordarError::write("output file", e))?;

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_target_rejected() {
        let err = quantize_file("/nonexistent/in.bin", "/nonexistent/out.bin", TensorType::Q4_2)
            .unwrap_err();
        assert!(err.to_string().contains("removed"));
    }

    #[test]
    fn test_compression_ratio() {
        let summary = QuantizeSummary {
            target: TensorType::Q4_0,
            original_bytes: 400,
            new_bytes: 100,
            histogram: [0; HISTOGRAM_BUCKETS],
            tensors: Vec::new(),
        };
        assert!((summary.compression_ratio() - 4.0).abs() < f64::EPSILON);
    }
}
