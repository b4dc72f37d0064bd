use nodecall_codec::Buffer;
use tracing::{debug, trace};

use crate::codec::{FrameConfig, HEADER_SIZE};
use crate::error::{FrameError, Result};

// Cap on the up-front reservation for an announced payload; the buffer grows
// as bytes actually arrive.
const MAX_PREALLOCATION: usize = 64 * 1024;

/// Reassembles length-prefixed frames from arbitrarily split chunks.
///
/// The first four bytes of every frame land in a fixed header array; payload
/// bytes are appended to a pooled [`Buffer`] until the announced length is
/// reached, at which point the buffer is handed out and reassembly restarts.
#[derive(Debug)]
pub struct FrameAssembler {
    header: [u8; HEADER_SIZE],
    header_filled: usize,
    expected: usize,
    payload: Buffer,
    max_frame_size: usize,
}

impl FrameAssembler {
    /// Create an assembler with default configuration.
    pub fn new() -> Self {
        Self::with_config(&FrameConfig::default())
    }

    pub fn with_config(config: &FrameConfig) -> Self {
        Self {
            header: [0; HEADER_SIZE],
            header_filled: 0,
            expected: 0,
            payload: Buffer::new(),
            max_frame_size: config.max_frame_size,
        }
    }

    /// Feed one received chunk, calling `on_frame` for every frame it
    /// completes. Returns the number of completed frames.
    ///
    /// An announced length above the maximum frame size is an error and
    /// leaves the assembler reset; the stream cannot be resynchronized.
    pub fn push<F>(&mut self, mut data: &[u8], mut on_frame: F) -> Result<usize>
    where
        F: FnMut(Buffer),
    {
        let mut completed = 0;

        while !data.is_empty() {
            if self.header_filled < HEADER_SIZE {
                let take = (HEADER_SIZE - self.header_filled).min(data.len());
                self.header[self.header_filled..self.header_filled + take]
                    .copy_from_slice(&data[..take]);
                self.header_filled += take;
                data = &data[take..];

                if self.header_filled < HEADER_SIZE {
                    break;
                }

                let len = u32::from_le_bytes(self.header) as usize;
                if len > self.max_frame_size {
                    self.reset();
                    debug!(size = len, max = self.max_frame_size, "rejecting oversized frame");
                    return Err(FrameError::FrameTooLarge {
                        size: len,
                        max: self.max_frame_size,
                    });
                }

                self.expected = len;
                if len == 0 {
                    on_frame(Buffer::new());
                    completed += 1;
                    self.header_filled = 0;
                    continue;
                }
                if !self.payload.is_allocated() {
                    self.payload = Buffer::with_capacity(len.min(MAX_PREALLOCATION));
                }
                continue;
            }

            let need = self.expected - self.payload.len();
            let take = need.min(data.len());
            self.payload.write(&data[..take]);
            data = &data[take..];

            if self.payload.len() == self.expected {
                trace!(len = self.expected, "frame complete");
                on_frame(self.payload.take());
                completed += 1;
                self.header_filled = 0;
                self.expected = 0;
            }
        }

        Ok(completed)
    }

    /// Whether a frame is partially received.
    pub fn has_partial(&self) -> bool {
        self.header_filled > 0
    }

    /// Bytes buffered toward the current partial frame, header included.
    pub fn pending_bytes(&self) -> usize {
        self.header_filled + self.payload.len()
    }

    /// Discard any partial frame and release the reassembly buffer.
    pub fn reset(&mut self) {
        self.header_filled = 0;
        self.expected = 0;
        self.payload.free();
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Update the limit for subsequent frames.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::codec::{encode_frame, DEFAULT_MAX_FRAME_SIZE};

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(payload, DEFAULT_MAX_FRAME_SIZE, &mut buf).unwrap();
        buf.to_vec()
    }

    fn collect(assembler: &mut FrameAssembler, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for chunk in chunks {
            assembler
                .push(chunk, |buffer| frames.push(buffer.as_slice().to_vec()))
                .unwrap();
        }
        frames
    }

    #[test]
    fn test_single_chunk() {
        let wire = frame(b"hello, nodecall!");
        let mut assembler = FrameAssembler::new();
        let frames = collect(&mut assembler, &[&wire]);
        assert_eq!(frames, vec![b"hello, nodecall!".to_vec()]);
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_split_in_header() {
        let wire = frame(b"split");
        let mut assembler = FrameAssembler::new();
        let frames = collect(&mut assembler, &[&wire[..2], &wire[2..]]);
        assert_eq!(frames, vec![b"split".to_vec()]);
    }

    #[test]
    fn test_byte_by_byte() {
        let wire = frame(b"one byte at a time");
        let mut assembler = FrameAssembler::new();
        let chunks: Vec<&[u8]> = wire.chunks(1).collect();
        let frames = collect(&mut assembler, &chunks);
        assert_eq!(frames, vec![b"one byte at a time".to_vec()]);
    }

    #[test]
    fn test_partial_frame_is_held() {
        let wire = frame(b"pending");
        let mut assembler = FrameAssembler::new();
        let frames = collect(&mut assembler, &[&wire[..HEADER_SIZE + 3]]);
        assert!(frames.is_empty());
        assert!(assembler.has_partial());
        assert_eq!(assembler.pending_bytes(), HEADER_SIZE + 3);

        assembler.reset();
        assert!(!assembler.has_partial());
        assert_eq!(assembler.pending_bytes(), 0);
    }

    #[test]
    fn test_multiple_frames_one_chunk() {
        let mut wire = frame(b"first");
        wire.extend(frame(b""));
        wire.extend(frame(b"third"));

        let mut assembler = FrameAssembler::new();
        let mut count = 0;
        let mut frames = Vec::new();
        count += assembler
            .push(&wire, |buffer| frames.push(buffer.as_slice().to_vec()))
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(frames, vec![b"first".to_vec(), Vec::new(), b"third".to_vec()]);
    }

    #[test]
    fn test_empty_frame_delivered_on_header() {
        let mut assembler = FrameAssembler::new();
        let completed = assembler.push(&[0, 0, 0, 0], |buffer| assert!(buffer.is_empty()));
        assert_eq!(completed, Ok(1));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let config = FrameConfig { max_frame_size: 8 };
        let mut assembler = FrameAssembler::with_config(&config);
        let result = assembler.push(&9u32.to_le_bytes(), |_| panic!("no frame expected"));
        assert_eq!(result, Err(FrameError::FrameTooLarge { size: 9, max: 8 }));
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_payload_buffer_is_handed_out() {
        let wire = frame(b"owned");
        let mut assembler = FrameAssembler::new();
        let mut delivered = None;
        assembler.push(&wire, |buffer| delivered = Some(buffer)).unwrap();

        let delivered = delivered.expect("frame should be delivered");
        assert_eq!(delivered.as_slice(), b"owned");
        assert_eq!(assembler.pending_bytes(), 0);
    }
}
