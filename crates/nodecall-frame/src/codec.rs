use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: payload length (4 bytes, little-endian).
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode the header announcing a payload of `len` bytes.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────────┐
/// │ Length (4B)  │ Payload          │
/// │ u32 LE       │ (Length bytes)   │
/// └──────────────┴──────────────────┘
/// ```
pub fn encode_header(len: usize, max: usize) -> Result<[u8; HEADER_SIZE]> {
    if len > max || len > u32::MAX as usize {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: max.min(u32::MAX as usize),
        });
    }
    Ok((len as u32).to_le_bytes())
}

/// Append a complete frame (header and payload) to `dst`.
pub fn encode_frame(payload: &[u8], max: usize, dst: &mut BytesMut) -> Result<()> {
    let header = encode_header(payload.len(), max)?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&header);
    dst.put_slice(payload);
    Ok(())
}

/// Configuration for framing on one connection context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_frame_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
