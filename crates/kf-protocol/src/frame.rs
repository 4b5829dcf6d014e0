//! Frame header encoding/decoding
//!
//! The frame format uses a 5-byte header:
//! - channel: 1 byte (u8)
//! - kind: 1 byte (u8)
//! - payload_length: 3 bytes (u24, big-endian, max 16MB)

use bytes::{Buf, BufMut, BytesMut};

use crate::channel::ChannelId;
use crate::error::ProtocolError;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 5;

/// Largest payload the 24-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// Frame kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A channel pair is opened; payload is the remote port (u16 LE)
    Open = 0x01,
    /// Channel payload bytes
    Data = 0x02,
    /// Sender will write no more on this channel
    Close = 0x03,
}

impl FrameKind {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Close),
            _ => None,
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Channel this frame belongs to
    pub channel: ChannelId,
    /// What the payload means
    pub kind: FrameKind,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn new(channel: ChannelId, kind: FrameKind, payload_length: u32) -> Self {
        Self {
            channel,
            kind,
            payload_length,
        }
    }

    /// Append the 5 header bytes to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.channel.as_u8());
        dst.put_u8(self.kind.as_u8());
        dst.put_uint(u64::from(self.payload_length), 3);
    }

    /// Consume a header from the front of `src`
    ///
    /// `Ok(None)` while fewer than [`HEADER_SIZE`] bytes are buffered.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the kind first so a bad header leaves the buffer untouched
        let kind_byte = src[1];
        let kind = FrameKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownFrameKind(kind_byte))?;

        let channel = ChannelId::new(src.get_u8());
        src.advance(1);
        let payload_length = src.get_uint(3) as u32;

        Ok(Some(Self {
            channel,
            kind,
            payload_length,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(ChannelId::data(4), FrameKind::Data, 70_000);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[..], &[8, 0x02, 0x01, 0x11, 0x70]);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_max_payload_length() {
        let header = FrameHeader::new(ChannelId::data(0), FrameKind::Data, MAX_PAYLOAD_SIZE as u32);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload_length, MAX_PAYLOAD_SIZE as u32);
    }

    #[test]
    fn test_insufficient_bytes() {
        let mut buf = BytesMut::from(&[0u8; 4][..]);
        let result = FrameHeader::decode(&mut buf).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_unknown_frame_kind() {
        let mut buf = BytesMut::from(&[0, 0xFE, 0, 0, 10][..]);
        let result = FrameHeader::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnknownFrameKind(0xFE))));
    }
}
