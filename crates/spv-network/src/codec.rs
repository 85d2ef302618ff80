//! P2P protocol codec for message framing.
//!
//! Every message travels in the same envelope:
//!
//! ```text
//! +----------+--------------+----------+----------+
//! |  Magic   |   Command    |  Length  | Checksum |
//! | 4 bytes  |  12 bytes    | 4 bytes  | 4 bytes  |
//! +----------+--------------+----------+----------+
//! |                    Payload                    |
//! |                 (Length bytes)                |
//! +-----------------------------------------------+
//! ```
//!
//! - Magic: network identifier
//! - Command: ASCII name, zero-padded
//! - Length: payload length in bytes (little-endian)
//! - Checksum: first 4 bytes of double-SHA256(payload)

use crate::{Message, NetworkError, NetworkResult};
use bytes::{Buf, BufMut, BytesMut};
use spv_consensus::sha256d;
use tokio_util::codec::{Decoder, Encoder};

/// Envelope size: magic (4) + command (12) + length (4) + checksum (4).
pub const HEADER_SIZE: usize = 24;

/// Width of the command field.
const COMMAND_SIZE: usize = 12;

/// Default payload limit (32 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Message codec for the Bitcoin-family P2P protocol.
pub struct MessageCodec {
    /// Network magic bytes.
    magic: [u8; 4],
    /// Maximum allowed payload size.
    max_size: usize,
}

impl MessageCodec {
    /// Create a codec for a network.
    pub fn new(magic: [u8; 4], max_size: usize) -> Self {
        Self { magic, max_size }
    }

    /// Create a codec with the default payload limit.
    pub fn with_magic(magic: [u8; 4]) -> Self {
        Self::new(magic, DEFAULT_MAX_MESSAGE_SIZE)
    }

    fn checksum(payload: &[u8]) -> [u8; 4] {
        let hash = sha256d(payload);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash.as_bytes()[0..4]);
        checksum
    }

    fn parse_command(raw: &[u8]) -> NetworkResult<String> {
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let (name, padding) = raw.split_at(end);
        if name.is_empty()
            || !name.iter().all(|b| b.is_ascii_graphic())
            || padding.iter().any(|b| *b != 0)
        {
            return Err(NetworkError::UnknownCommand(hex::encode(raw)));
        }
        Ok(String::from_utf8_lossy(name).into_owned())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Parse header without consuming
        if src[0..4] != self.magic {
            return Err(NetworkError::MagicMismatch(hex::encode(&src[0..4])));
        }

        let command = Self::parse_command(&src[4..4 + COMMAND_SIZE])?;
        let length = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        let checksum: [u8; 4] = [src[20], src[21], src[22], src[23]];

        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total_size = HEADER_SIZE + length;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        if Self::checksum(&payload) != checksum {
            return Err(NetworkError::ChecksumMismatch { command });
        }

        Message::decode(&command, payload).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = item.command().as_bytes();
        if command.len() > COMMAND_SIZE {
            return Err(NetworkError::InvalidMessage(format!(
                "command too long: {}",
                item.command()
            )));
        }

        let payload = item.encode_payload()?;
        if payload.len() > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: payload.len(),
                max: self.max_size,
            });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&self.magic);
        dst.put_slice(command);
        dst.put_bytes(0, COMMAND_SIZE - command.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&Self::checksum(&payload));
        dst.put_slice(&payload);

        Ok(())
    }
}
