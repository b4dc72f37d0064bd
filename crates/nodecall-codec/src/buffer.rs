use bytes::{BufMut, Bytes, BytesMut};

use crate::pool::BufferPool;

/// Exclusively-owned growable byte buffer backed by pooled storage.
///
/// Storage is taken from the global [`BufferPool`] on the first write and
/// handed back on [`Buffer::free`] or drop. A `Buffer` is never cloned; moving
/// it moves ownership of the bytes.
#[derive(Default)]
pub struct Buffer {
    storage: Option<BytesMut>,
}

impl Buffer {
    /// An empty buffer that holds no storage yet.
    pub const fn new() -> Self {
        Self { storage: None }
    }

    /// An empty buffer with at least `capacity` bytes reserved.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut buffer = Self::new();
        buffer.storage_mut().reserve(capacity);
        buffer
    }

    fn storage_mut(&mut self) -> &mut BytesMut {
        self.storage
            .get_or_insert_with(|| BufferPool::global().acquire())
    }

    /// Append bytes, growing as needed.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.storage_mut().put_slice(data);
    }

    /// Append a single byte.
    pub fn write_u8(&mut self, byte: u8) {
        self.storage_mut().put_u8(byte);
    }

    /// Mutable access to byte `index`, zero-extending the buffer when
    /// `index` lies past the current end.
    pub fn at_mut(&mut self, index: usize) -> &mut u8 {
        let storage = self.storage_mut();
        if index >= storage.len() {
            storage.resize(index + 1, 0);
        }
        &mut storage[index]
    }

    /// Byte at `index`, or `None` past the end.
    pub fn get(&self, index: usize) -> Option<u8> {
        self.as_slice().get(index).copied()
    }

    /// Up to `len` bytes starting at `offset`.
    ///
    /// The result is truncated to the available bytes and is empty when
    /// `offset` lies past the end.
    pub fn read_at(&self, offset: usize, len: usize) -> &[u8] {
        let data = self.as_slice();
        if offset >= data.len() {
            return &[];
        }
        let end = offset.saturating_add(len).min(data.len());
        &data[offset..end]
    }

    pub fn len(&self) -> usize {
        self.storage.as_ref().map_or(0, BytesMut::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the buffer currently holds pooled storage.
    pub fn is_allocated(&self) -> bool {
        self.storage.is_some()
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Some(storage) => &storage[..],
            None => &[],
        }
    }

    /// Drop the contents but keep the storage.
    pub fn clear(&mut self) {
        if let Some(storage) = self.storage.as_mut() {
            storage.clear();
        }
    }

    /// Return the storage to the pool, leaving the buffer empty.
    pub fn free(&mut self) {
        if let Some(storage) = self.storage.take() {
            BufferPool::global().release(storage);
        }
    }

    /// Move the contents out, leaving this buffer empty and unallocated.
    pub fn take(&mut self) -> Buffer {
        Buffer {
            storage: self.storage.take(),
        }
    }

    /// Convert into immutable shared bytes for the write path.
    ///
    /// The storage leaves the pool for good; it is freed when the last
    /// `Bytes` handle drops.
    pub fn freeze(mut self) -> Bytes {
        match self.storage.take() {
            Some(storage) => storage.freeze(),
            None => Bytes::new(),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.free();
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        let mut buffer = Buffer::new();
        buffer.write(data);
        buffer
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Buffer::from(data.as_slice())
    }
}

impl From<BytesMut> for Buffer {
    fn from(storage: BytesMut) -> Self {
        Self {
            storage: Some(storage),
        }
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Buffer {}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_holds_no_storage() {
        let buffer = Buffer::new();
        assert!(!buffer.is_allocated());
        assert!(buffer.is_empty());
        assert_eq!(buffer.as_slice(), b"");
    }

    #[test]
    fn test_write_appends() {
        let mut buffer = Buffer::new();
        buffer.write(b"hello");
        buffer.write_u8(b',');
        buffer.write(b" world");
        assert!(buffer.is_allocated());
        assert_eq!(buffer.as_slice(), b"hello, world");
    }

    #[test]
    fn test_at_mut_extends() {
        let mut buffer = Buffer::from(&b"ab"[..]);
        *buffer.at_mut(4) = b'z';
        assert_eq!(buffer.as_slice(), b"ab\0\0z");
        *buffer.at_mut(0) = b'A';
        assert_eq!(buffer.get(0), Some(b'A'));
        assert_eq!(buffer.get(5), None);
    }

    #[test]
    fn test_read_at_truncates() {
        let buffer = Buffer::from(&b"0123456789"[..]);
        assert_eq!(buffer.read_at(2, 3), b"234");
        assert_eq!(buffer.read_at(8, 10), b"89");
        assert_eq!(buffer.read_at(10, 1), b"");
        assert_eq!(buffer.read_at(usize::MAX, usize::MAX), b"");
    }

    #[test]
    fn test_free_releases_storage() {
        let mut buffer = Buffer::from(&b"payload"[..]);
        buffer.free();
        assert!(!buffer.is_allocated());
        assert!(buffer.is_empty());

        // Still usable after free.
        buffer.write(b"again");
        assert_eq!(buffer.as_slice(), b"again");
    }

    #[test]
    fn test_take_moves_contents() {
        let mut buffer = Buffer::from(&b"move me"[..]);
        let moved = buffer.take();
        assert_eq!(moved.as_slice(), b"move me");
        assert!(!buffer.is_allocated());
    }

    #[test]
    fn test_freeze_keeps_bytes() {
        let buffer = Buffer::from(vec![1u8, 2, 3]);
        let bytes = buffer.freeze();
        assert_eq!(&bytes[..], &[1, 2, 3]);
        assert!(Buffer::new().freeze().is_empty());
    }

    #[test]
    fn test_clear_keeps_storage() {
        let mut buffer = Buffer::from(&b"xyz"[..]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.is_allocated());
    }
}
