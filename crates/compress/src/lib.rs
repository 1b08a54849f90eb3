//! Raw deflate helpers for the compressed token stream.
//!
//! The wire carries bare DEFLATE data with no zlib header or trailer,
//! matching a `deflateInit2()` call with negative `windowBits`. Two
//! stateful wrappers keep the compressor and decompressor dictionaries
//! synchronized across matched blocks whose bytes never travel the wire:
//! [`DeflateStream`] on the sending side and [`InflateStream`] on the
//! receiving side.

mod level;
mod stream;

pub use level::{CompressionLevel, CompressionLevelError};
pub use stream::{
    compress_to_vec, decompress_to_vec, DeflateStream, InflateStream, HISTORY_LEN,
};
