//! Primitive little-endian I/O over generic readers and writers
//!
//! All helpers take a short `what` tag naming the thing being moved, which
//! lands in the error message on failure. Writes go through `write_all`, so
//! success always means the full buffer reached the writer.

use crate::error::{RecordarError, Result};
use std::io::{Read, Seek, SeekFrom, Write};

/// Read a little-endian u32.
pub fn read_u32<R: Read>(reader: &mut R, what: &'static str) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|e| RecordarError::read(what, e))?;
    Ok(u32::from_le_bytes(buf))
}

/// Write a little-endian u32.
pub fn write_u32<W: Write>(writer: &mut W, value: u32, what: &'static str) -> Result<()> {
    writer
        .write_all(&value.to_le_bytes())
        .map_err(|e| RecordarError::write(what, e))
}

/// Read exactly `len` bytes into a fresh buffer.
pub fn read_bytes<R: Read>(reader: &mut R, len: usize, what: &'static str) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|e| RecordarError::read(what, e))?;
    Ok(buf)
}

/// Fill `buf` completely from the reader.
pub fn read_into<R: Read>(reader: &mut R, buf: &mut [u8], what: &'static str) -> Result<()> {
    reader
        .read_exact(buf)
        .map_err(|e| RecordarError::read(what, e))
}

/// Write a raw byte buffer.
pub fn write_bytes<W: Write>(writer: &mut W, data: &[u8], what: &'static str) -> Result<()> {
    writer
        .write_all(data)
        .map_err(|e| RecordarError::write(what, e))
}

/// Advance the cursor by `bytes` without reading.
///
/// The offset math stays in 64 bits; skipping a payload larger than 4 GiB is
/// a single seek.
pub fn skip<S: Seek>(seekable: &mut S, bytes: u64, what: &'static str) -> Result<()> {
    let offset = i64::try_from(bytes).map_err(|_| RecordarError::Shape {
        reason: format!("payload of {bytes} bytes exceeds the seekable range"),
    })?;
    seekable
        .seek(SeekFrom::Current(offset))
        .map_err(|e| RecordarError::FileSeek {
            what: what.to_string(),
            source: e,
        })?;
    Ok(())
}
