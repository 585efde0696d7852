//! Block quantization codecs
//!
//! Implements the payload layouts of the container's quantized data types.
//! All formats pack 32 values per block with half-precision scale fields:
//!
//! - `Q4_0` (18 bytes): f16 scale `d`, 16 bytes of nibbles; `v = d * (q - 8)`
//! - `Q4_1` (20 bytes): f16 `d`, f16 `m`, 16 bytes of nibbles; `v = d * q + m`
//! - `Q5_0` (22 bytes): f16 `d`, u32 high bits, 16 bytes of nibbles;
//!   `v = d * (q - 16)` with `q` a 5-bit code
//! - `Q5_1` (24 bytes): f16 `d`, f16 `m`, u32 high bits, 16 nibble bytes;
//!   `v = d * q + m`
//! - `Q8_0` (34 bytes): f16 scale `d`, 32 int8 values; `v = d * q`
//!
//! Nibble packing is split, not interleaved: byte `j` holds element `j` in
//! its low nibble and element `j + 16` in its high nibble, and for the 5-bit
//! formats the high bit of element `j` lives at bit `j` of the packed u32.
//!
//! Quantizing also accumulates a 16-bucket code histogram used only for
//! reporting: 4-bit codes bucket by value, 5-bit codes by `code >> 1`, and
//! 8-bit codes by `(q + 128) >> 4`.

use crate::error::{RecordarError, Result};
use crate::format::TensorType;
use half::f16;

/// Elements per quantization block
pub const BLOCK_SIZE: usize = 32;

/// Buckets in the reporting histogram
pub const HISTOGRAM_BUCKETS: usize = 16;

/// Pre-computed f16 to f32 lookup table (65536 entries)
///
/// Initialized once on first access; shared by every dequantization and
/// row-dot hot path.
static F16_TO_F32_LUT: std::sync::LazyLock<Box<[f32; 65536]>> = std::sync::LazyLock::new(|| {
    let mut lut = Box::new([0.0f32; 65536]);
    for (i, slot) in lut.iter_mut().enumerate() {
        *slot = f16::from_bits(i as u16).to_f32();
    }
    lut
});

/// Fast f16 bits to f32 conversion through the lookup table.
#[inline]
pub(crate) fn f16_to_f32(bits: u16) -> f32 {
    F16_TO_F32_LUT[bits as usize]
}

#[inline]
fn read_f16(bytes: &[u8]) -> f32 {
    f16_to_f32(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
fn push_f16(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&f16::from_f32(value).to_le_bytes());
}

/// Convert a row of f16 payload bytes to f32 values.
///
/// # Errors
///
/// `Shape` if the byte length is odd or does not match `dst`.
pub fn f16_row_to_f32(src: &[u8], dst: &mut [f32]) -> Result<()> {
    if src.len() != dst.len() * 2 {
        return Err(RecordarError::Shape {
            reason: format!(
                "f16 payload of {} bytes does not hold {} values",
                src.len(),
                dst.len()
            ),
        });
    }
    for (chunk, out) in src.chunks_exact(2).zip(dst.iter_mut()) {
        *out = f16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
    Ok(())
}

/// Convert f32 values to a row of f16 payload bytes, appending to `dst`.
pub fn f32_row_to_f16(src: &[f32], dst: &mut Vec<u8>) {
    dst.reserve(src.len() * 2);
    for &value in src {
        push_f16(dst, value);
    }
}

/// Reinterpret a little-endian f32 payload as values.
///
/// # Errors
///
/// `Shape` if the byte length does not match `dst`.
pub fn f32_row_from_bytes(src: &[u8], dst: &mut [f32]) -> Result<()> {
    if src.len() != dst.len() * 4 {
        return Err(RecordarError::Shape {
            reason: format!(
                "f32 payload of {} bytes does not hold {} values",
                src.len(),
                dst.len()
            ),
        });
    }
    for (chunk, out) in src.chunks_exact(4).zip(dst.iter_mut()) {
        *out = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(())
}

fn require_block_multiple(target: TensorType, len: usize) -> Result<()> {
    if len % BLOCK_SIZE != 0 {
        return Err(RecordarError::Shape {
            reason: format!(
                "{target} quantization requires an element count that is a multiple of \
                 {BLOCK_SIZE}, got {len}"
            ),
        });
    }
    Ok(())
}

/// Quantize `src` into the payload layout of `target`, appending to `dst`.
///
/// `dst` is cleared first; its capacity is reused across calls. `hist`
/// accumulates the code histogram for block targets; F32 and F16 targets
/// convert without touching it.
///
/// # Errors
///
/// `Shape` if a block target gets an element count that is not a multiple
/// of 32; `DataType` for removed targets.
pub fn quantize_row(
    target: TensorType,
    src: &[f32],
    dst: &mut Vec<u8>,
    hist: &mut [i64; HISTOGRAM_BUCKETS],
) -> Result<()> {
    dst.clear();
    match target {
        TensorType::F32 => {
            dst.reserve(src.len() * 4);
            for &value in src {
                dst.extend_from_slice(&value.to_le_bytes());
            }
        }
        TensorType::F16 => f32_row_to_f16(src, dst),
        TensorType::Q4_0 => {
            require_block_multiple(target, src.len())?;
            for block in src.chunks_exact(BLOCK_SIZE) {
                quantize_block_q4_0(block, dst, hist);
            }
        }
        TensorType::Q4_1 => {
            require_block_multiple(target, src.len())?;
            for block in src.chunks_exact(BLOCK_SIZE) {
                quantize_block_q4_1(block, dst, hist);
            }
        }
        TensorType::Q5_0 => {
            require_block_multiple(target, src.len())?;
            for block in src.chunks_exact(BLOCK_SIZE) {
                quantize_block_q5_0(block, dst, hist);
            }
        }
        TensorType::Q5_1 => {
            require_block_multiple(target, src.len())?;
            for block in src.chunks_exact(BLOCK_SIZE) {
                quantize_block_q5_1(block, dst, hist);
            }
        }
        TensorType::Q8_0 => {
            require_block_multiple(target, src.len())?;
            for block in src.chunks_exact(BLOCK_SIZE) {
                quantize_block_q8_0(block, dst, hist);
            }
        }
        TensorType::Q4_1O | TensorType::Q4_2 | TensorType::Q4_3 => {
            return Err(RecordarError::DataType {
                reason: format!("cannot produce removed format {target}"),
            });
        }
    }
    Ok(())
}

fn quantize_block_q4_0(block: &[f32], dst: &mut Vec<u8>, hist: &mut [i64; HISTOGRAM_BUCKETS]) {
    // Scale by the signed value of largest magnitude so the code range
    // stays symmetric around the 8 offset.
    let mut amax = 0.0f32;
    let mut max = 0.0f32;
    for &v in block {
        if v.abs() > amax {
            amax = v.abs();
            max = v;
        }
    }

    let d = max / -8.0;
    let id = if d != 0.0 { 1.0 / d } else { 0.0 };

    push_f16(dst, d);
    for j in 0..BLOCK_SIZE / 2 {
        let q0 = ((block[j] * id + 8.5) as i32).clamp(0, 15) as u8;
        let q1 = ((block[j + BLOCK_SIZE / 2] * id + 8.5) as i32).clamp(0, 15) as u8;
        hist[q0 as usize] += 1;
        hist[q1 as usize] += 1;
        dst.push(q0 | (q1 << 4));
    }
}

fn quantize_block_q4_1(block: &[f32], dst: &mut Vec<u8>, hist: &mut [i64; HISTOGRAM_BUCKETS]) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in block {
        min = min.min(v);
        max = max.max(v);
    }

    let d = (max - min) / 15.0;
    let id = if d != 0.0 { 1.0 / d } else { 0.0 };

    push_f16(dst, d);
    push_f16(dst, min);
    for j in 0..BLOCK_SIZE / 2 {
        let q0 = (((block[j] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
        let q1 = (((block[j + BLOCK_SIZE / 2] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
        hist[q0 as usize] += 1;
        hist[q1 as usize] += 1;
        dst.push(q0 | (q1 << 4));
    }
}

fn quantize_block_q5_0(block: &[f32], dst: &mut Vec<u8>, hist: &mut [i64; HISTOGRAM_BUCKETS]) {
    let mut amax = 0.0f32;
    let mut max = 0.0f32;
    for &v in block {
        if v.abs() > amax {
            amax = v.abs();
            max = v;
        }
    }

    let d = max / -16.0;
    let id = if d != 0.0 { 1.0 / d } else { 0.0 };

    push_f16(dst, d);

    let mut qh = 0u32;
    let mut nibbles = [0u8; BLOCK_SIZE / 2];
    for j in 0..BLOCK_SIZE / 2 {
        let q0 = ((block[j] * id + 16.5) as i32).clamp(0, 31) as u8;
        let q1 = ((block[j + BLOCK_SIZE / 2] * id + 16.5) as i32).clamp(0, 31) as u8;
        hist[(q0 >> 1) as usize] += 1;
        hist[(q1 >> 1) as usize] += 1;
        nibbles[j] = (q0 & 0x0F) | ((q1 & 0x0F) << 4);
        qh |= u32::from(q0 >> 4) << j;
        qh |= u32::from(q1 >> 4) << (j + BLOCK_SIZE / 2);
    }

    dst.extend_from_slice(&qh.to_le_bytes());
    dst.extend_from_slice(&nibbles);
}

fn quantize_block_q5_1(block: &[f32], dst: &mut Vec<u8>, hist: &mut [i64; HISTOGRAM_BUCKETS]) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in block {
        min = min.min(v);
        max = max.max(v);
    }

    let d = (max - min) / 31.0;
    let id = if d != 0.0 { 1.0 / d } else { 0.0 };

    push_f16(dst, d);
    push_f16(dst, min);

    let mut qh = 0u32;
    let mut nibbles = [0u8; BLOCK_SIZE / 2];
    for j in 0..BLOCK_SIZE / 2 {
        let q0 = (((block[j] - min) * id + 0.5) as i32).clamp(0, 31) as u8;
        let q1 = (((block[j + BLOCK_SIZE / 2] - min) * id + 0.5) as i32).clamp(0, 31) as u8;
        hist[(q0 >> 1) as usize] += 1;
        hist[(q1 >> 1) as usize] += 1;
        nibbles[j] = (q0 & 0x0F) | ((q1 & 0x0F) << 4);
        qh |= u32::from(q0 >> 4) << j;
        qh |= u32::from(q1 >> 4) << (j + BLOCK_SIZE / 2);
    }

    dst.extend_from_slice(&qh.to_le_bytes());
    dst.extend_from_slice(&nibbles);
}

fn quantize_block_q8_0(block: &[f32], dst: &mut Vec<u8>, hist: &mut [i64; HISTOGRAM_BUCKETS]) {
    let amax = block.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));

    let d = amax / 127.0;
    let id = if d != 0.0 { 1.0 / d } else { 0.0 };

    push_f16(dst, d);
    for &v in block {
        let q = (v * id).round().clamp(-128.0, 127.0) as i8;
        hist[((i32::from(q) + 128) >> 4) as usize] += 1;
        dst.push(q as u8);
    }
}

/// Dequantize one row of payload bytes into `dst`.
///
/// `dst.len()` selects the element count; for block types it must be a
/// multiple of 32 and `src` must hold exactly the matching payload bytes.
///
/// # Errors
///
/// `Shape` on any size mismatch; `DataType` for removed formats.
pub fn dequantize_row(ttype: TensorType, src: &[u8], dst: &mut [f32]) -> Result<()> {
    let expected = ttype.payload_bytes(dst.len() as u64, 1);
    if src.len() as u64 != expected {
        return Err(RecordarError::Shape {
            reason: format!(
                "{ttype} payload of {} bytes does not hold {} values (expected {expected})",
                src.len(),
                dst.len()
            ),
        });
    }

    match ttype {
        TensorType::F32 => f32_row_from_bytes(src, dst)?,
        TensorType::F16 => f16_row_to_f32(src, dst)?,
        TensorType::Q4_0 => {
            for (bytes, out) in src.chunks_exact(18).zip(dst.chunks_exact_mut(BLOCK_SIZE)) {
                dequantize_block_q4_0(bytes, out);
            }
        }
        TensorType::Q4_1 => {
            for (bytes, out) in src.chunks_exact(20).zip(dst.chunks_exact_mut(BLOCK_SIZE)) {
                dequantize_block_q4_1(bytes, out);
            }
        }
        TensorType::Q5_0 => {
            for (bytes, out) in src.chunks_exact(22).zip(dst.chunks_exact_mut(BLOCK_SIZE)) {
                dequantize_block_q5_0(bytes, out);
            }
        }
        TensorType::Q5_1 => {
            for (bytes, out) in src.chunks_exact(24).zip(dst.chunks_exact_mut(BLOCK_SIZE)) {
                dequantize_block_q5_1(bytes, out);
            }
        }
        TensorType::Q8_0 => {
            for (bytes, out) in src.chunks_exact(34).zip(dst.chunks_exact_mut(BLOCK_SIZE)) {
                dequantize_block_q8_0(bytes, out);
            }
        }
        TensorType::Q4_1O | TensorType::Q4_2 | TensorType::Q4_3 => {
            return Err(RecordarError::DataType {
                reason: format!("cannot read removed format {ttype}"),
            });
        }
    }
    Ok(())
}

fn dequantize_block_q4_0(bytes: &[u8], out: &mut [f32]) {
    let d = read_f16(bytes);
    for (j, &byte) in bytes[2..18].iter().enumerate() {
        out[j] = d * (f32::from(byte & 0x0F) - 8.0);
        out[j + 16] = d * (f32::from(byte >> 4) - 8.0);
    }
}

fn dequantize_block_q4_1(bytes: &[u8], out: &mut [f32]) {
    let d = read_f16(bytes);
    let m = read_f16(&bytes[2..]);
    for (j, &byte) in bytes[4..20].iter().enumerate() {
        out[j] = d * f32::from(byte & 0x0F) + m;
        out[j + 16] = d * f32::from(byte >> 4) + m;
    }
}

fn dequantize_block_q5_0(bytes: &[u8], out: &mut [f32]) {
    let d = read_f16(bytes);
    let qh = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    for (j, &byte) in bytes[6..22].iter().enumerate() {
        let q0 = u32::from(byte & 0x0F) | (((qh >> j) & 1) << 4);
        let q1 = u32::from(byte >> 4) | (((qh >> (j + 16)) & 1) << 4);
        out[j] = d * (q0 as f32 - 16.0);
        out[j + 16] = d * (q1 as f32 - 16.0);
    }
}

fn dequantize_block_q5_1(bytes: &[u8], out: &mut [f32]) {
    let d = read_f16(bytes);
    let m = read_f16(&bytes[2..]);
    let qh = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    for (j, &byte) in bytes[8..24].iter().enumerate() {
        let q0 = u32::from(byte & 0x0F) | (((qh >> j) & 1) << 4);
        let q1 = u32::from(byte >> 4) | (((qh >> (j + 16)) & 1) << 4);
        out[j] = d * q0 as f32 + m;
        out[j + 16] = d * q1 as f32 + m;
    }
}

fn dequantize_block_q8_0(bytes: &[u8], out: &mut [f32]) {
    let d = read_f16(bytes);
    for (j, &byte) in bytes[2..34].iter().enumerate() {
        out[j] = d * f32::from(byte as i8);
    }
}

/// Dot product of one stored row against an f32 vector.
///
/// Blocks are expanded on the stack; no heap scratch. Callers guarantee the
/// row length matches `x.len()` (the graph builder sizes every matvec).
pub(crate) fn dot_row(ttype: TensorType, row: &[u8], x: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    match ttype {
        TensorType::F32 => {
            for (chunk, &xv) in row.chunks_exact(4).zip(x) {
                acc += f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) * xv;
            }
        }
        TensorType::F16 => {
            for (chunk, &xv) in row.chunks_exact(2).zip(x) {
                acc += f16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]])) * xv;
            }
        }
        _ => {
            let block_bytes = ttype.block_bytes();
            let mut values = [0.0f32; BLOCK_SIZE];
            for (bytes, xs) in row.chunks_exact(block_bytes).zip(x.chunks(BLOCK_SIZE)) {
                match ttype {
                    TensorType::Q4_0 => dequantize_block_q4_0(bytes, &mut values),
                    TensorType::Q4_1 => dequantize_block_q4_1(bytes, &mut values),
                    TensorType::Q5_0 => dequantize_block_q5_0(bytes, &mut values),
                    TensorType::Q5_1 => dequantize_block_q5_1(bytes, &mut values),
                    TensorType::Q8_0 => dequantize_block_q8_0(bytes, &mut values),
                    _ => {}
                }
                for (v, &xv) in values.iter().zip(xs) {
                    acc += v * xv;
                }
            }
        }
    }
    acc
}
