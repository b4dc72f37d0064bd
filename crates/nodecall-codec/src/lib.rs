//! Pooled buffers and the binary codec used by every nodecall frame.
//!
//! Values are encoded without type tags:
//! - Fixed-width primitives in little-endian byte order
//! - Strings, byte arrays, sequences, sets and maps as a 4-byte signed count
//!   followed by the elements
//! - Tuples as the plain concatenation of their fields
//!
//! Both ends must agree on the schema. A [`Reader`] never reads past the end
//! of its input; truncated input yields [`CodecError::Truncated`].

pub mod buffer;
pub mod error;
pub mod pool;
pub mod reader;
pub mod traits;
pub mod writer;

pub use buffer::Buffer;
pub use error::{CodecError, Result};
pub use pool::{BufferPool, DEFAULT_POOL_CAPACITY, DEFAULT_RETAIN_CAPACITY};
pub use reader::Reader;
pub use traits::{Decode, Encode};
pub use writer::Writer;

/// Encode a single value into a fresh buffer.
pub fn to_buffer<T: Encode + ?Sized>(value: &T) -> Result<Buffer> {
    let mut writer = Writer::new();
    writer.write(value);
    writer.finish()
}

/// Decode a single value from the start of `data`.
pub fn from_slice<T: Decode>(data: &[u8]) -> Result<T> {
    Reader::new(data).read()
}
