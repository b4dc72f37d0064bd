use crate::buffer::Buffer;
use crate::error::{CodecError, Result};
use crate::traits::Encode;

/// Builds an encoded value inside an owned [`Buffer`].
///
/// Encoding is infallible except for lengths that do not fit the 32-bit
/// prefix. The first such error is latched and reported by [`Writer::finish`],
/// which keeps [`Encode`] implementations free of error plumbing.
#[derive(Debug, Default)]
pub struct Writer {
    buffer: Buffer,
    error: Option<CodecError>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue writing at the end of an existing buffer.
    pub fn from_buffer(buffer: Buffer) -> Self {
        Self {
            buffer,
            error: None,
        }
    }

    /// Encode a value.
    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(self);
        self
    }

    /// Append raw bytes with no length prefix.
    pub fn put_slice(&mut self, data: &[u8]) {
        self.buffer.write(data);
    }

    pub fn put_u8(&mut self, byte: u8) {
        self.buffer.write_u8(byte);
    }

    /// Write a 4-byte signed little-endian length prefix.
    pub fn write_len(&mut self, len: usize) {
        match i32::try_from(len) {
            Ok(len) => self.put_slice(&len.to_le_bytes()),
            Err(_) => {
                if self.error.is_none() {
                    self.error = Some(CodecError::LengthOverflow(len));
                }
                // Keep the layout stable so later fields still line up.
                self.put_slice(&i32::MAX.to_le_bytes());
            }
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// The finished buffer, or the first encoding error.
    pub fn finish(self) -> Result<Buffer> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.buffer),
        }
    }

    /// The buffer regardless of latched errors.
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}
