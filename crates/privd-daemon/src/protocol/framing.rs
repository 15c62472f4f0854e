//! Length-prefixed frame codec for the UDS channel.
//!
//! Frames are encoded as a 4-byte big-endian length prefix followed by the
//! payload. The decoder validates the advertised length against the active
//! size limit BEFORE reserving buffer space, so a hostile peer cannot force
//! a large allocation with a forged prefix.
//!
//! The codec starts with the strict handshake limit
//! ([`MAX_HANDSHAKE_FRAME_SIZE`]); once the handshake completes both sides
//! call [`FrameCodec::upgrade_to_full_frame_size`] to admit full-size
//! protocol frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{ProtocolError, MAX_FRAME_SIZE, MAX_HANDSHAKE_FRAME_SIZE};

/// Number of bytes in the length prefix.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Length-prefixed frame codec.
///
/// # Invariants
///
/// - The length prefix is checked against `max_frame_size` before any
///   payload bytes are buffered.
/// - Encoded frames never exceed `max_frame_size`.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the handshake frame size limit.
    ///
    /// New connections always start here; the limit is raised only after a
    /// successful handshake.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_HANDSHAKE_FRAME_SIZE,
        }
    }

    /// Create a codec with an explicit frame size limit.
    #[must_use]
    pub const fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Raise the limit to the full protocol frame size.
    ///
    /// Called after a successful handshake.
    pub fn upgrade_to_full_frame_size(&mut self) {
        self.max_frame_size = MAX_FRAME_SIZE;
    }

    /// Current frame size limit.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        // Size check before allocation.
        if length > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(length, self.max_frame_size));
        }

        if src.len() < LENGTH_PREFIX_SIZE + length {
            src.reserve(LENGTH_PREFIX_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let frame = src.split_to(length).freeze();
        Ok(Some(frame))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(
                item.len(),
                self.max_frame_size,
            ));
        }

        let length = u32::try_from(item.len()).map_err(|_| ProtocolError::InvalidFrame {
            reason: format!("frame length {} exceeds u32 range", item.len()),
        })?;

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u32(length);
        dst.put_slice(&item);
        Ok(())
    }
}
