//! Offload Protocol Definitions
//!
//! Wire types and framing for the control connections an agent opens to an
//! offload broker. Every message is a MessagePack value prefixed with its
//! 4-byte big-endian length.

pub mod codec;
pub mod messages;

pub use codec::{encode_frame, CodecError, MessageStream};
pub use messages::*;

/// ALPN protocol identifier negotiated with the broker
pub const ALPN_PROTOCOL: &[u8] = b"pp/1";

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the length prefix in front of every frame
pub const FRAME_HEADER_SIZE: usize = 4;
