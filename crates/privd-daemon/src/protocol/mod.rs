//! Wire protocol for the helper's Unix domain socket channel.
//!
//! Layers, bottom up:
//!
//! - [`framing`]: 4-byte big-endian length-prefixed frames with size limits
//! - [`handshake`]: Hello/HelloAck/HelloNack service and version negotiation
//! - [`messages`]: helper requests, replies, and unsolicited events
//!
//! # Security Considerations
//!
//! Frame size limits are enforced before allocation, and handshake frames
//! have a stricter limit than post-handshake traffic because they are
//! parsed before the peer has proven anything about itself.

pub mod error;
pub mod framing;
pub mod handshake;
pub mod messages;

pub use error::{
    ProtocolError, ProtocolResult, MAX_FRAME_SIZE, MAX_HANDSHAKE_FRAME_SIZE, PROTOCOL_VERSION,
};
pub use framing::FrameCodec;
pub use handshake::{
    parse_handshake_message, serialize_handshake_message, ClientHandshake, HandshakeMessage,
    HandshakeOutcome, Hello, HelloAck, HelloNack, ServerHandshake,
};
pub use messages::{
    parse_request, parse_server_message, serialize_request, serialize_server_message, ClientEvent,
    HelperCallError, HelperRequest, HelperResponse, ServerMessage,
};
