use crate::buffer::Buffer;
use crate::error::{CodecError, Result};
use crate::traits::Decode;

/// Borrowing cursor over encoded bytes.
///
/// Every read checks the remaining length first. On truncation the cursor
/// moves to the end of the input so later reads fail the same way.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn from_buffer(buffer: &'a Buffer) -> Self {
        Self::new(buffer.as_slice())
    }

    /// Current read position.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Decode a value.
    pub fn read<T: Decode>(&mut self) -> Result<T> {
        T::decode(self)
    }

    /// Borrow the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if n > remaining {
            self.offset = self.data.len();
            return Err(CodecError::Truncated {
                needed: n,
                remaining,
            });
        }
        let start = self.offset;
        self.offset += n;
        Ok(&self.data[start..self.offset])
    }

    /// Copy the next `N` bytes into an array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a 4-byte signed length prefix.
    pub fn read_len(&mut self) -> Result<usize> {
        let len = i32::from_le_bytes(self.read_array()?);
        usize::try_from(len).map_err(|_| CodecError::NegativeLength(len))
    }

    /// Everything after the cursor, consuming it.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        rest
    }

    /// Upper bound for collection pre-allocation, given a minimum encoded
    /// element width.
    pub(crate) fn capacity_hint(&self, count: usize, min_width: usize) -> usize {
        count.min(self.remaining() / min_width.max(1))
    }
}
