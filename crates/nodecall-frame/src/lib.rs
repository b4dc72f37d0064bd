//! Record framing for nodecall streams.
//!
//! Every message on the wire is a 4-byte little-endian payload length
//! followed by exactly that many payload bytes. There is no magic, no version
//! byte and no channel; a zero-length frame is valid.
//!
//! [`FrameAssembler`] turns an arbitrary sequence of received chunks back into
//! whole payloads, so one chunk may complete several frames and one frame may
//! span many chunks.

pub mod assembler;
pub mod codec;
pub mod error;

pub use assembler::FrameAssembler;
pub use codec::{encode_frame, encode_header, FrameConfig, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
pub use error::{FrameError, Result};
