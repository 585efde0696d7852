//! Model container format
//!
//! A Recordar model file is a fixed 24-byte header followed by a stream of
//! tensor records running to end-of-file. All integers are little-endian.
//!
//! ```text
//! header:  magic(u32) version(u32) n_vocab(u32) n_embed(u32) n_layer(u32) data_type(u32)
//! record:  dim_count(u32) key_length(u32) data_type(u32) width(u32)
//!          [height(u32) if dim_count == 2]
//!          key_bytes[key_length] payload[data_type-sized]
//! ```
//!
//! Offsets and payload sizes are computed in 64-bit arithmetic throughout so
//! files larger than 4 GiB stream correctly.

mod header;
mod io;
mod types;

pub use header::{FileHeader, TensorHeader};
pub use io::{read_bytes, read_into, read_u32, skip, write_bytes, write_u32};
pub use types::{
    TensorType, FILE_MAGIC, FILE_VERSION, FILE_VERSION_MAX, FILE_VERSION_MIN,
    QUANTIZED_FILE_VERSION,
};
