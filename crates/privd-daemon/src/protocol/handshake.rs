//! Connection handshake protocol.
//!
//! Every connection opens with a JSON handshake before any helper calls are
//! accepted:
//!
//! ```text
//! Client                                Server
//!   |--- Hello { version, service } ----->|
//!   |<-- HelloAck { version, info } ------|   (accepted)
//!   |<-- HelloNack { code, message } -----|   (rejected, then close)
//! ```
//!
//! The server validates the requested service name and protocol version.
//! Handshake frames are subject to the strict handshake size limit; the
//! frame limit is raised only after the handshake succeeds.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{ProtocolError, ProtocolResult, MAX_HANDSHAKE_FRAME_SIZE, PROTOCOL_VERSION};

/// Nack error code for a protocol version mismatch.
pub const NACK_VERSION_MISMATCH: &str = "version_mismatch";

/// Nack error code for a connection the server refuses to serve.
pub const NACK_REJECTED: &str = "rejected";

/// Initial message sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version the client speaks.
    pub protocol_version: u32,
    /// Client identification string (name/version, for diagnostics only).
    pub client_info: String,
    /// Service name the client wants to reach.
    pub service: String,
}

/// Positive server response: the connection is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    /// Protocol version the server speaks.
    pub protocol_version: u32,
    /// Server identification string (name/version, for diagnostics only).
    pub server_info: String,
}

/// Negative server response: the connection is refused and will be closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloNack {
    /// Machine-readable rejection code.
    pub error_code: String,
    /// Human-readable rejection message.
    pub message: String,
    /// Protocol version the server speaks.
    pub server_version: u32,
}

/// Envelope for handshake messages on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Client greeting.
    Hello(Hello),
    /// Server acceptance.
    HelloAck(HelloAck),
    /// Server rejection.
    HelloNack(HelloNack),
}

/// Parse a handshake message from a frame.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the frame exceeds the
/// handshake limit, or [`ProtocolError::Serialization`] if the payload is
/// not a valid handshake message.
pub fn parse_handshake_message(frame: &Bytes) -> ProtocolResult<HandshakeMessage> {
    if frame.len() > MAX_HANDSHAKE_FRAME_SIZE {
        return Err(ProtocolError::frame_too_large(
            frame.len(),
            MAX_HANDSHAKE_FRAME_SIZE,
        ));
    }
    serde_json::from_slice(frame).map_err(|e| ProtocolError::Serialization {
        reason: format!("invalid handshake message: {e}"),
    })
}

/// Serialize a handshake message into a frame payload.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] on encoding failure, or
/// [`ProtocolError::FrameTooLarge`] if the encoded message exceeds the
/// handshake limit.
pub fn serialize_handshake_message(message: &HandshakeMessage) -> ProtocolResult<Bytes> {
    let encoded = serde_json::to_vec(message).map_err(|e| ProtocolError::Serialization {
        reason: format!("failed to encode handshake message: {e}"),
    })?;
    if encoded.len() > MAX_HANDSHAKE_FRAME_SIZE {
        return Err(ProtocolError::frame_too_large(
            encoded.len(),
            MAX_HANDSHAKE_FRAME_SIZE,
        ));
    }
    Ok(Bytes::from(encoded))
}

/// Server-side handshake state machine.
///
/// Processes exactly one [`Hello`] and produces either an ack or a nack.
#[derive(Debug)]
pub struct ServerHandshake {
    server_info: String,
    service: String,
    complete: bool,
}

/// Outcome of processing a client hello.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Connection accepted; send the ack and raise the frame limit.
    Accepted {
        /// The ack to send to the client.
        ack: HelloAck,
        /// Client identification from the hello, for logging.
        client_info: String,
    },
    /// Connection refused; send the nack and close.
    Refused {
        /// The nack to send to the client.
        nack: HelloNack,
    },
}

impl ServerHandshake {
    /// Create a server handshake for one connection.
    #[must_use]
    pub fn new(server_info: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            server_info: server_info.into(),
            service: service.into(),
            complete: false,
        }
    }

    /// Process the client's hello.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::HandshakeFailed`] if a hello was already
    /// processed on this connection.
    pub fn process_hello(&mut self, hello: &Hello) -> ProtocolResult<HandshakeOutcome> {
        if self.complete {
            return Err(ProtocolError::handshake_failed(
                "hello received after handshake completed",
            ));
        }
        self.complete = true;

        if hello.service != self.service {
            return Ok(HandshakeOutcome::Refused {
                nack: HelloNack {
                    error_code: NACK_REJECTED.to_string(),
                    message: format!("unknown service: {}", hello.service),
                    server_version: PROTOCOL_VERSION,
                },
            });
        }

        if hello.protocol_version != PROTOCOL_VERSION {
            return Ok(HandshakeOutcome::Refused {
                nack: HelloNack {
                    error_code: NACK_VERSION_MISMATCH.to_string(),
                    message: format!(
                        "unsupported protocol version {} (server speaks {})",
                        hello.protocol_version, PROTOCOL_VERSION
                    ),
                    server_version: PROTOCOL_VERSION,
                },
            });
        }

        Ok(HandshakeOutcome::Accepted {
            ack: HelloAck {
                protocol_version: PROTOCOL_VERSION,
                server_info: self.server_info.clone(),
            },
            client_info: hello.client_info.clone(),
        })
    }
}

/// Client-side handshake state machine.
#[derive(Debug)]
pub struct ClientHandshake {
    client_info: String,
    service: String,
}

impl ClientHandshake {
    /// Create a client handshake.
    #[must_use]
    pub fn new(client_info: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            client_info: client_info.into(),
            service: service.into(),
        }
    }

    /// Build the hello to send.
    #[must_use]
    pub fn create_hello(&self) -> Hello {
        Hello {
            protocol_version: PROTOCOL_VERSION,
            client_info: self.client_info.clone(),
            service: self.service.clone(),
        }
    }

    /// Process the server's response, returning the server info on success.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::VersionMismatch`] on a version nack,
    /// [`ProtocolError::HandshakeFailed`] on any other nack or an
    /// out-of-order message.
    pub fn process_response(&self, response: HandshakeMessage) -> ProtocolResult<String> {
        match response {
            HandshakeMessage::HelloAck(ack) => {
                if ack.protocol_version != PROTOCOL_VERSION {
                    return Err(ProtocolError::VersionMismatch {
                        client_version: PROTOCOL_VERSION,
                        server_version: ack.protocol_version,
                    });
                }
                Ok(ack.server_info)
            }
            HandshakeMessage::HelloNack(nack) => {
                if nack.error_code == NACK_VERSION_MISMATCH {
                    Err(ProtocolError::VersionMismatch {
                        client_version: PROTOCOL_VERSION,
                        server_version: nack.server_version,
                    })
                } else {
                    Err(ProtocolError::handshake_failed(format!(
                        "server refused connection: {} ({})",
                        nack.message, nack.error_code
                    )))
                }
            }
            HandshakeMessage::Hello(_) => Err(ProtocolError::handshake_failed(
                "unexpected hello from server",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(version: u32, service: &str) -> Hello {
        Hello {
            protocol_version: version,
            client_info: "test-client/1.0".to_string(),
            service: service.to_string(),
        }
    }

    #[test]
    fn test_successful_handshake() {
        let mut server = ServerHandshake::new("privd/1.0", "com.example.helper");
        let client = ClientHandshake::new("test-client/1.0", "com.example.helper");

        let outcome = server.process_hello(&client.create_hello()).unwrap();
        let HandshakeOutcome::Accepted { ack, client_info } = outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(client_info, "test-client/1.0");

        let server_info = client
            .process_response(HandshakeMessage::HelloAck(ack))
            .unwrap();
        assert_eq!(server_info, "privd/1.0");
    }

    #[test]
    fn test_version_mismatch_refused() {
        let mut server = ServerHandshake::new("privd/1.0", "svc");
        let outcome = server
            .process_hello(&hello(PROTOCOL_VERSION + 1, "svc"))
            .unwrap();
        let HandshakeOutcome::Refused { nack } = outcome else {
            panic!("expected refusal");
        };
        assert_eq!(nack.error_code, NACK_VERSION_MISMATCH);

        let client = ClientHandshake::new("c", "svc");
        let err = client
            .process_response(HandshakeMessage::HelloNack(nack))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { .. }));
    }

    #[test]
    fn test_unknown_service_refused() {
        let mut server = ServerHandshake::new("privd/1.0", "svc");
        let outcome = server
            .process_hello(&hello(PROTOCOL_VERSION, "other"))
            .unwrap();
        let HandshakeOutcome::Refused { nack } = outcome else {
            panic!("expected refusal");
        };
        assert_eq!(nack.error_code, NACK_REJECTED);
        assert!(nack.message.contains("other"));
    }

    #[test]
    fn test_duplicate_hello_rejected() {
        let mut server = ServerHandshake::new("privd/1.0", "svc");
        server.process_hello(&hello(PROTOCOL_VERSION, "svc")).unwrap();
        let err = server
            .process_hello(&hello(PROTOCOL_VERSION, "svc"))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::HandshakeFailed { .. }));
    }

    #[test]
    fn test_wire_round_trip() {
        let message = HandshakeMessage::Hello(hello(PROTOCOL_VERSION, "svc"));
        let frame = serialize_handshake_message(&message).unwrap();
        let parsed = parse_handshake_message(&frame).unwrap();
        assert!(matches!(parsed, HandshakeMessage::Hello(h) if h.service == "svc"));
    }

    #[test]
    fn test_oversized_handshake_frame_rejected() {
        let frame = Bytes::from(vec![b'x'; MAX_HANDSHAKE_FRAME_SIZE + 1]);
        let err = parse_handshake_message(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }
}
