//! Message framing codec.
//!
//! Every message travels in a frame:
//!
//! ```text
//! +----------+--------------+----------+----------+
//! |  Magic   |   Command    |  Length  | Checksum |
//! | 4 bytes  | 12 bytes     | 4 bytes  | 4 bytes  |
//! +----------+--------------+----------+----------+
//! |                 Payload                       |
//! |              (Length bytes)                   |
//! +-----------------------------------------------+
//! ```
//!
//! - Magic: network identifier, written big-endian
//! - Command: ASCII, NUL-padded to 12 bytes
//! - Length: payload length, little-endian
//! - Checksum: first 4 bytes of double-SHA256(payload)

use crate::{Message, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Frame header size: magic (4) + command (12) + length (4) + checksum (4).
pub const FRAME_HEADER_SIZE: usize = 24;

/// Maximum payload size accepted or produced.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Framing codec for one network's magic.
pub struct FrameCodec {
    /// Network magic.
    magic: u32,
    /// Maximum allowed payload size.
    max_size: usize,
}

impl FrameCodec {
    /// Create a codec for the given packet magic.
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            max_size: MAX_MESSAGE_SIZE,
        }
    }

    /// First 4 bytes of double-SHA256 over the payload.
    fn checksum(payload: &[u8]) -> [u8; 4] {
        let first = Sha256::digest(payload);
        let second = Sha256::digest(first);
        let mut out = [0u8; 4];
        out.copy_from_slice(&second[0..4]);
        out
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Parse the header without consuming.
        let magic = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if magic != self.magic {
            return Err(ProtocolError::BadMagic {
                expected: self.magic,
                got: magic,
            });
        }

        let command_bytes = &src[4..16];
        let end = command_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(command_bytes.len());
        if command_bytes[end..].iter().any(|&b| b != 0)
            || !command_bytes[..end].iter().all(|b| b.is_ascii_graphic())
        {
            return Err(ProtocolError::BadCommand(hex::encode(command_bytes)));
        }
        let command = String::from_utf8_lossy(&command_bytes[..end]).to_string();

        let length = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        if length > self.max_size {
            return Err(ProtocolError::Oversized {
                size: length,
                max: self.max_size,
            });
        }

        let total = FRAME_HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let checksum = [src[20], src[21], src[22], src[23]];
        src.advance(FRAME_HEADER_SIZE);
        let payload: Bytes = src.split_to(length).freeze();

        if Self::checksum(&payload) != checksum {
            return Err(ProtocolError::BadChecksum { command });
        }

        let message =
            Message::parse_payload(&command, &payload).map_err(|e| match e {
                ProtocolError::Parse(source) => ProtocolError::BadPayload { command, source },
                other => other,
            })?;

        if let Message::Unknown { command, .. } = &message {
            warn!(command = %command, bytes = payload.len(), "Skipping unknown message");
        }

        Ok(Some(message))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload();
        if payload.len() > self.max_size {
            return Err(ProtocolError::Oversized {
                size: payload.len(),
                max: self.max_size,
            });
        }

        let command = item.command();
        let mut command_bytes = [0u8; 12];
        let len = command.len().min(12);
        command_bytes[..len].copy_from_slice(&command.as_bytes()[..len]);

        dst.reserve(FRAME_HEADER_SIZE + payload.len());
        dst.put_u32(self.magic);
        dst.put_slice(&command_bytes);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&Self::checksum(&payload));
        dst.put_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MAGIC: u32 = 0xF9BE_B4D9;

    fn encode(message: Message) -> BytesMut {
        let mut codec = FrameCodec::new(TEST_MAGIC);
        let mut buf = BytesMut::new();
        codec.encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut buf = encode(Message::Ping(99));
        let mut codec = FrameCodec::new(TEST_MAGIC);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Ping(99));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let full = encode(Message::Ping(1));
        let mut codec = FrameCodec::new(TEST_MAGIC);

        let mut partial = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[10..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let mut buf = encode(Message::Verack);
        let mut codec = FrameCodec::new(0x0B11_0907);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let mut buf = encode(Message::Ping(1));
        let payload_start = FRAME_HEADER_SIZE;
        buf[payload_start] ^= 0xFF;
        let mut codec = FrameCodec::new(TEST_MAGIC);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::BadChecksum { .. })
        ));
    }

    #[test]
    fn test_magic_on_wire_is_big_endian() {
        let buf = encode(Message::Verack);
        assert_eq!(&buf[0..4], &[0xF9, 0xBE, 0xB4, 0xD9]);
    }

    #[test]
    fn test_command_nul_padding() {
        let buf = encode(Message::Verack);
        assert_eq!(&buf[4..16], b"verack\0\0\0\0\0\0");
    }

    #[test]
    fn test_unknown_command_skipped_not_fatal() {
        let mut codec = FrameCodec::new(TEST_MAGIC);
        let mut buf = BytesMut::new();
        codec
            .encode(
                Message::Unknown {
                    command: "future".to_string(),
                    payload: Bytes::from_static(b"abc"),
                },
                &mut buf,
            )
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, Message::Unknown { .. }));
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = encode(Message::Ping(1));
        buf.extend_from_slice(&encode(Message::Pong(1)));
        let mut codec = FrameCodec::new(TEST_MAGIC);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::Ping(1));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::Pong(1));
        assert!(buf.is_empty());
    }
}
