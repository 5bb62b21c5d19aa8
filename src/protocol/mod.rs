//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the muxrpc packet stream:
//! - 9-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{flags, BodyType, Header, DEFAULT_MAX_BODY_SIZE, GOODBYE, HEADER_SIZE};
