//! Owned tensors
//!
//! A [`Tensor`] is a payload in its on-disk type plus its shape. Vectors
//! that feed element-wise kernels are held as f32; matrices stay in their
//! stored type and are consumed row-by-row through [`Tensor::row_dot`].

use crate::error::{RecordarError, Result};
use crate::format::TensorType;
use crate::quantize::blocks;

/// Tensor payload storage
#[derive(Debug, Clone)]
pub enum TensorData {
    /// Decoded f32 values
    F32(Vec<f32>),
    /// Raw payload bytes in the on-disk layout of the tensor's type
    Raw(Vec<u8>),
}

/// An owned tensor with its container shape
///
/// `width` is the row length in elements; `height` the row count (1 for
/// vectors).
#[derive(Debug, Clone)]
pub struct Tensor {
    data_type: TensorType,
    width: usize,
    height: usize,
    data: TensorData,
}

impl Tensor {
    /// Wrap a raw payload read from a file.
    ///
    /// # Errors
    ///
    /// `Shape` if the byte count does not match the type and shape.
    pub fn from_payload(
        data_type: TensorType,
        width: usize,
        height: usize,
        payload: Vec<u8>,
    ) -> Result<Self> {
        let expected = data_type.payload_bytes(width as u64, height as u64);
        if payload.len() as u64 != expected {
            return Err(RecordarError::Shape {
                reason: format!(
                    "{data_type} tensor {width}x{height} needs {expected} payload bytes, \
                     got {}",
                    payload.len()
                ),
            });
        }

        let data = if data_type == TensorType::F32 {
            let mut values = vec![0.0f32; width * height];
            blocks::f32_row_from_bytes(&payload, &mut values)?;
            TensorData::F32(values)
        } else {
            TensorData::Raw(payload)
        };

        Ok(Self {
            data_type,
            width,
            height,
            data,
        })
    }

    /// Build an f32 vector tensor directly.
    #[must_use]
    pub fn from_f32(values: Vec<f32>) -> Self {
        Self {
            data_type: TensorType::F32,
            width: values.len(),
            height: 1,
            data: TensorData::F32(values),
        }
    }

    /// Payload data type.
    #[must_use]
    pub fn data_type(&self) -> TensorType {
        self.data_type
    }

    /// Row length in elements.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Row count.
    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Total element count.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.width * self.height
    }

    /// The f32 values, when this tensor is stored decoded.
    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            TensorData::Raw(_) => None,
        }
    }

    /// Decode the whole tensor to f32, consuming it.
    ///
    /// Used by the loader to hold every 1-D parameter in the form the
    /// element-wise kernels consume.
    ///
    /// # Errors
    ///
    /// `Shape` if a block-typed width is not a whole number of blocks.
    pub fn into_f32(self) -> Result<Self> {
        let values = match self.data {
            TensorData::F32(values) => values,
            TensorData::Raw(payload) => {
                let mut values = vec![0.0f32; self.width * self.height];
                // Rows decode independently so padded row tails never leak
                // into the next row.
                let row_bytes = self
                    .data_type
                    .payload_bytes(self.width as u64, 1) as usize;
                for (row, out) in payload
                    .chunks_exact(row_bytes)
                    .zip(values.chunks_exact_mut(self.width))
                {
                    blocks::dequantize_row(self.data_type, row, out)?;
                }
                values
            }
        };

        Ok(Self {
            data_type: TensorType::F32,
            width: self.width,
            height: self.height,
            data: TensorData::F32(values),
        })
    }

    /// Dot product of row `row` with `x`.
    ///
    /// `x.len()` must equal [`Tensor::width`]; the graph builder guarantees
    /// this for every matvec it wires.
    #[must_use]
    pub fn row_dot(&self, row: usize, x: &[f32]) -> f32 {
        debug_assert!(row < self.height);
        debug_assert_eq!(x.len(), self.width);
        match &self.data {
            TensorData::F32(values) => {
                let start = row * self.width;
                values[start..start + self.width]
                    .iter()
                    .zip(x)
                    .map(|(a, b)| a * b)
                    .sum()
            }
            TensorData::Raw(payload) => {
                let row_bytes = self
                    .data_type
                    .payload_bytes(self.width as u64, 1) as usize;
                let start = row * row_bytes;
                blocks::dot_row(self.data_type, &payload[start..start + row_bytes], x)
            }
        }
    }

    /// Decode row `row` into `dst` (used for embedding lookup).
    ///
    /// # Errors
    ///
    /// `Shape` if `dst.len()` does not match the row width.
    pub fn read_row(&self, row: usize, dst: &mut [f32]) -> Result<()> {
        if dst.len() != self.width || row >= self.height {
            return Err(RecordarError::Shape {
                reason: format!(
                    "row {row} of {} does not fit a {} element buffer",
                    self.height,
                    dst.len()
                ),
            });
        }
        match &self.data {
            TensorData::F32(values) => {
                let start = row * self.width;
                dst.copy_from_slice(&values[start..start + self.width]);
                Ok(())
            }
            TensorData::Raw(payload) => {
                let row_bytes = self
                    .data_type
                    .payload_bytes(self.width as u64, 1) as usize;
                let start = row * row_bytes;
                blocks::dequantize_row(self.data_type, &payload[start..start + row_bytes], dst)
            }
        }
    }
}
