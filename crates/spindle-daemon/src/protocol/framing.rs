//! Frame codec: length-prefixed JSON header plus raw body.
//!
//! Wire layout, network byte order:
//!
//! ```text
//! +---------------------+------------------------+------------------+
//! | header_len (u16 BE) | header JSON            | body             |
//! +---------------------+------------------------+------------------+
//!                         header_len bytes         header.length bytes
//! ```
//!
//! The codec is a two-phase state machine: it first decodes the header,
//! then waits for the body the header declares. Limits are validated
//! before any allocation so a hostile length prefix cannot exhaust
//! memory. Frames are independent; streaming is a sequence of
//! `DATA_STREAM` frames sharing a `request_id`, not a codec concern.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{MAX_BODY_LEN, MAX_HEADER_LEN, ProtocolError, ProtocolResult};
use super::messages::{Header, Message};

/// Length of the header-length prefix.
const PREFIX_LEN: usize = 2;

#[derive(Debug)]
enum DecodeState {
    /// Waiting for the length prefix and header JSON.
    Header,
    /// Header decoded; waiting for `header.length` body bytes.
    Body(Header),
}

/// Codec for [`Message`] frames, used with [`tokio_util::codec::Framed`].
#[derive(Debug)]
pub struct MessageCodec {
    max_header_len: usize,
    max_body_len: usize,
    state: DecodeState,
}

impl MessageCodec {
    /// Create a codec with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(MAX_HEADER_LEN, MAX_BODY_LEN)
    }

    /// Create a codec with explicit header/body caps.
    #[must_use]
    pub fn with_limits(max_header_len: usize, max_body_len: usize) -> Self {
        Self {
            max_header_len,
            max_body_len,
            state: DecodeState::Header,
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Message>> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if src.len() < PREFIX_LEN {
                        return Ok(None);
                    }

                    let header_len = u16::from_be_bytes([src[0], src[1]]) as usize;
                    if header_len > self.max_header_len {
                        return Err(ProtocolError::HeaderTooLarge {
                            size: header_len,
                            max: self.max_header_len,
                        });
                    }

                    if src.len() < PREFIX_LEN + header_len {
                        src.reserve(PREFIX_LEN + header_len - src.len());
                        return Ok(None);
                    }

                    src.advance(PREFIX_LEN);
                    let header_bytes = src.split_to(header_len);
                    let header: Header = serde_json::from_slice(&header_bytes)
                        .map_err(|e| ProtocolError::BadHeader(e.to_string()))?;

                    let body_len = header.length as usize;
                    if body_len > self.max_body_len {
                        return Err(ProtocolError::BodyTooLarge {
                            size: body_len,
                            max: self.max_body_len,
                        });
                    }

                    self.state = DecodeState::Body(header);
                },
                DecodeState::Body(header) => {
                    let body_len = header.length as usize;
                    if src.len() < body_len {
                        src.reserve(body_len - src.len());
                        return Ok(None);
                    }

                    let body = src.split_to(body_len).freeze();
                    let DecodeState::Body(header) =
                        std::mem::replace(&mut self.state, DecodeState::Header)
                    else {
                        unreachable!("state checked above");
                    };
                    return Ok(Some(Message { header, body }));
                },
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> ProtocolResult<()> {
        debug_assert_eq!(item.header.length as usize, item.body.len());

        if item.body.len() > self.max_body_len {
            return Err(ProtocolError::BodyTooLarge {
                size: item.body.len(),
                max: self.max_body_len,
            });
        }

        let header_bytes =
            serde_json::to_vec(&item.header).map_err(|e| ProtocolError::BadHeader(e.to_string()))?;
        if header_bytes.len() > self.max_header_len || header_bytes.len() > usize::from(u16::MAX) {
            return Err(ProtocolError::HeaderTooLarge {
                size: header_bytes.len(),
                max: self.max_header_len.min(usize::from(u16::MAX)),
            });
        }

        dst.reserve(PREFIX_LEN + header_bytes.len() + item.body.len());
        dst.put_u16(header_bytes.len() as u16);
        dst.extend_from_slice(&header_bytes);
        dst.extend_from_slice(&item.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::messages::MessageType;

    fn sample(body: &'static [u8]) -> Message {
        Message::new(
            MessageType::DataStream,
            "r1",
            Bytes::from_static(body),
            false,
        )
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut codec = MessageCodec::new();
        let msg = sample(b"hello world");

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        // Wire starts with the big-endian header length.
        let header_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        assert_eq!(buf.len(), PREFIX_LEN + header_len + msg.body.len());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.header.msg_type, MessageType::DataStream);
        assert_eq!(decoded.header.request_id, "r1");
        assert_eq!(decoded.header.length as usize, decoded.body.len());
        assert_eq!(decoded.body, msg.body);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_prefix_waits() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&[0u8][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn partial_header_and_body_wait() {
        let mut codec = MessageCodec::new();
        let msg = sample(b"streaming body bytes");

        let mut full = BytesMut::new();
        codec.encode(msg, &mut full).unwrap();

        // Feed the wire bytes one at a time; only the final byte completes
        // the frame.
        let mut decoder = MessageCodec::new();
        let mut partial = BytesMut::new();
        let total = full.len();
        for (i, byte) in full.iter().enumerate() {
            partial.put_u8(*byte);
            let result = decoder.decode(&mut partial).unwrap();
            if i + 1 < total {
                assert!(result.is_none(), "frame completed early at byte {i}");
            } else {
                assert!(result.is_some());
            }
        }
    }

    #[test]
    fn empty_body_frame() {
        let mut codec = MessageCodec::new();
        let msg = sample(b"");

        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(sample(b"first"), &mut buf).unwrap();
        codec.encode(sample(b"second"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().body, &b"first"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().body, &b"second"[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn garbage_header_is_rejected() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u16(4);
        buf.extend_from_slice(b"????");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::BadHeader(_))
        ));
    }

    #[test]
    fn oversized_body_rejected_before_allocation() {
        let mut codec = MessageCodec::with_limits(MAX_HEADER_LEN, 16);
        let header = serde_json::to_vec(&Header {
            msg_type: MessageType::DataStream,
            length: 1024,
            request_id: "r1".to_string(),
            encrypted: false,
        })
        .unwrap();

        let mut buf = BytesMut::new();
        buf.put_u16(header.len() as u16);
        buf.extend_from_slice(&header);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::BodyTooLarge { size: 1024, max: 16 })
        ));
    }

    #[test]
    fn oversized_header_prefix_rejected() {
        let mut codec = MessageCodec::with_limits(8, MAX_BODY_LEN);
        let mut buf = BytesMut::new();
        buf.put_u16(9);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::HeaderTooLarge { size: 9, max: 8 })
        ));
    }

    #[test]
    fn encode_rejects_oversized_body() {
        let mut codec = MessageCodec::with_limits(MAX_HEADER_LEN, 8);
        let msg = sample(b"way more than eight bytes");

        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(msg, &mut buf),
            Err(ProtocolError::BodyTooLarge { .. })
        ));
    }

    #[test]
    fn unknown_type_in_header_is_rejected() {
        let mut codec = MessageCodec::new();
        let raw = br#"{"type":99,"length":0,"request_id":"r","encrypted":false}"#;

        let mut buf = BytesMut::new();
        buf.put_u16(raw.len() as u16);
        buf.extend_from_slice(raw);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::BadHeader(_))
        ));
    }
}
