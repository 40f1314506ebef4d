//! Metrelay Protocol Definitions
//!
//! This crate defines the messages exchanged between a metrelay agent and the
//! central proxy, along with the length-prefixed frame codec used on the wire.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, FrameCodec};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Port assumed when the proxy address carries none
pub const DEFAULT_PROXY_PORT: u16 = 50051;
