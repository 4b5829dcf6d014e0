//! Tokio codec for framed channel traffic

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::channel::ChannelId;
use crate::error::ProtocolError;
use crate::frame::{FrameHeader, FrameKind, MAX_PAYLOAD_SIZE};

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel this frame belongs to
    pub channel: ChannelId,
    /// Frame kind
    pub kind: FrameKind,
    /// Raw payload
    pub payload: Bytes,
}

impl Frame {
    /// Announce a channel pair for the given remote port
    pub fn open(channel: ChannelId, remote_port: u16) -> Self {
        let mut payload = BytesMut::with_capacity(2);
        payload.put_u16_le(remote_port);
        Self {
            channel,
            kind: FrameKind::Open,
            payload: payload.freeze(),
        }
    }

    /// Payload bytes for a channel
    pub fn data(channel: ChannelId, payload: Bytes) -> Self {
        Self {
            channel,
            kind: FrameKind::Data,
            payload,
        }
    }

    /// End of stream for a channel
    pub fn close(channel: ChannelId) -> Self {
        Self {
            channel,
            kind: FrameKind::Close,
            payload: Bytes::new(),
        }
    }

    /// Remote port carried by an `Open` frame
    pub fn port(&self) -> Option<u16> {
        match (self.kind, self.payload.as_ref()) {
            (FrameKind::Open, [lo, hi]) => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }
}

/// Codec for encoding/decoding channel frames
#[derive(Debug, Default)]
pub struct ChannelCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl ChannelCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for ChannelCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < payload_len {
            // Save header and wait for more data
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();

        if header.kind == FrameKind::Open && payload.len() != 2 {
            return Err(ProtocolError::MalformedOpen {
                channel: header.channel,
                len: payload.len(),
            });
        }

        Ok(Some(Frame {
            channel: header.channel,
            kind: header.kind,
            payload,
        }))
    }
}

impl Encoder<Frame> for ChannelCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        FrameHeader::new(frame.channel, frame.kind, payload_len as u32).encode(dst);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_SIZE;

    #[test]
    fn test_codec_data_frame() {
        let mut codec = ChannelCodec::new();

        let frame = Frame::data(ChannelId::data(2), Bytes::from("Hello, world!"));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 13);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_open_frame_carries_port() {
        let mut codec = ChannelCodec::new();

        let mut buf = BytesMut::new();
        codec.encode(Frame::open(ChannelId::data(1), 8080), &mut buf).unwrap();
        // Port travels little-endian, like the remote protocol's channel prefix
        assert_eq!(&buf[HEADER_SIZE..], &[0x90, 0x1F]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, FrameKind::Open);
        assert_eq!(decoded.port(), Some(8080));
    }

    #[test]
    fn test_malformed_open_rejected() {
        let mut codec = ChannelCodec::new();
        let mut buf = BytesMut::from(&[0, 0x01, 0, 0, 1, 0xAA][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedOpen { len: 1, .. })
        ));
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = ChannelCodec::new();

        let mut full_buf = BytesMut::new();
        codec
            .encode(Frame::data(ChannelId::data(0), Bytes::from_static(b"ping")), &mut full_buf)
            .unwrap();

        // Header only, then the rest
        let mut partial = full_buf.split_to(HEADER_SIZE + 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.payload.as_ref(), b"ping");
    }

    #[test]
    fn test_close_frame_is_header_only() {
        let mut codec = ChannelCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::close(ChannelId::error(5)), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, FrameKind::Close);
        assert_eq!(decoded.channel, ChannelId::error(5));
    }

    #[test]
    fn test_oversized_payload_rejected_on_encode() {
        let mut codec = ChannelCodec::new();
        let frame = Frame::data(ChannelId::data(0), Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]));
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
