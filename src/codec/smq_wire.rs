// SPDX-License-Identifier: MIT

//! Native SMQ framing (spec.md §4.3.1): a self-describing, length-prefixed
//! frame with a fixed header, an optional header map, an optional
//! destination, and — for MESSAGE only — a payload.

use std::io::{Read, Write};

use crate::message::{Headers, Message, MessageType};

use super::{read_exact_tracked, Codec, ProtocolError, MAX_PAYLOAD_LEN};

const MAGIC: [u8; 4] = *b"MSG:";

/// Stateless: every frame carries everything needed to decode it, so there
/// is nothing to remember between calls beyond the destination length
/// limits already enforced by the wire format.
#[derive(Debug, Default)]
pub struct SmqCodec;

impl SmqCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for SmqCodec {
    fn decode(&mut self, reader: &mut dyn Read) -> Result<Message, ProtocolError> {
        let mut magic = [0u8; 4];
        read_exact_tracked(reader, &mut magic)?;
        if magic != MAGIC {
            return Err(ProtocolError::Malformed("bad frame magic".into()));
        }

        let mut type_byte = [0u8; 1];
        read_exact_tracked(reader, &mut type_byte)?;
        let msg_type = MessageType::from_u8(type_byte[0])
            .ok_or_else(|| ProtocolError::Malformed(format!("unknown message type {}", type_byte[0])))?;

        let mut header_count = [0u8; 1];
        read_exact_tracked(reader, &mut header_count)?;

        let mut headers = Headers::new();
        for _ in 0..header_count[0] {
            let mut name_len = [0u8; 1];
            read_exact_tracked(reader, &mut name_len)?;
            if name_len[0] == 0 {
                return Err(ProtocolError::Malformed("zero-length header name".into()));
            }
            let mut name_bytes = vec![0u8; name_len[0] as usize];
            read_exact_tracked(reader, &mut name_bytes)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| ProtocolError::Malformed("header name is not valid UTF-8".into()))?;

            let mut value_len = [0u8; 2];
            read_exact_tracked(reader, &mut value_len)?;
            let value_len = u16::from_le_bytes(value_len) as usize;
            let mut value_bytes = vec![0u8; value_len];
            read_exact_tracked(reader, &mut value_bytes)?;
            let value = String::from_utf8(value_bytes)
                .map_err(|_| ProtocolError::Malformed("header value is not valid UTF-8".into()))?;

            headers.insert(name, value);
        }

        let destination = if msg_type.requires_destination() {
            let mut dest_len = [0u8; 1];
            read_exact_tracked(reader, &mut dest_len)?;
            if dest_len[0] == 0 {
                return Err(ProtocolError::Malformed(
                    "destination required but missing".into(),
                ));
            }
            let mut dest_bytes = vec![0u8; dest_len[0] as usize];
            read_exact_tracked(reader, &mut dest_bytes)?;
            String::from_utf8(dest_bytes)
                .map_err(|_| ProtocolError::Malformed("destination is not valid UTF-8".into()))?
        } else {
            String::new()
        };

        let payload = if matches!(msg_type, MessageType::Message) {
            let mut len_bytes = [0u8; 4];
            read_exact_tracked(reader, &mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > MAX_PAYLOAD_LEN {
                return Err(ProtocolError::LimitExceeded {
                    declared: len,
                    limit: MAX_PAYLOAD_LEN,
                });
            }
            let mut payload = vec![0u8; len];
            read_exact_tracked(reader, &mut payload)?;
            payload
        } else {
            Vec::new()
        };

        let mut message = Message::new(msg_type, destination, payload);
        *message.headers_mut() = headers;
        Ok(message)
    }

    fn encode(&mut self, message: &Message, writer: &mut dyn Write) -> Result<(), ProtocolError> {
        let msg_type = message.msg_type();
        if msg_type.requires_destination() && message.destination().is_empty() {
            return Err(ProtocolError::Malformed(
                "destination required but empty".into(),
            ));
        }

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.push(msg_type as u8);

        let header_count = message.headers().len();
        if header_count > u8::MAX as usize {
            return Err(ProtocolError::Malformed("too many headers".into()));
        }
        out.push(header_count as u8);
        for (name, value) in message.headers() {
            if name.is_empty() || name.len() > u8::MAX as usize {
                return Err(ProtocolError::Malformed("header name length out of range".into()));
            }
            if value.len() > u16::MAX as usize {
                return Err(ProtocolError::Malformed("header value too long".into()));
            }
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(value.len() as u16).to_le_bytes());
            out.extend_from_slice(value.as_bytes());
        }

        if msg_type.requires_destination() {
            let dest = message.destination();
            if dest.len() > u8::MAX as usize {
                return Err(ProtocolError::Malformed("destination too long".into()));
            }
            out.push(dest.len() as u8);
            out.extend_from_slice(dest.as_bytes());
        }

        if matches!(msg_type, MessageType::Message) {
            let payload = message.payload();
            if payload.len() > MAX_PAYLOAD_LEN {
                return Err(ProtocolError::LimitExceeded {
                    declared: payload.len(),
                    limit: MAX_PAYLOAD_LEN,
                });
            }
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(payload);
        }

        writer.write_all(&out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(message: &Message) -> Message {
        let mut codec = SmqCodec::new();
        let mut buf = Vec::new();
        codec.encode(message, &mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        codec.decode(&mut cursor).unwrap()
    }

    #[test]
    fn publish_roundtrips_with_headers() {
        let mut m = Message::new(MessageType::Message, "q/1", b"hello".to_vec());
        m.set_header("content-type", "text/plain");
        let decoded = roundtrip(&m);
        assert_eq!(decoded.destination(), "q/1");
        assert_eq!(decoded.payload(), b"hello");
        assert_eq!(decoded.header("content-type"), Some("text/plain"));
    }

    #[test]
    fn ping_has_no_destination_or_payload() {
        let m = Message::without_destination(MessageType::Ping, Vec::new());
        let decoded = roundtrip(&m);
        assert_eq!(decoded.destination(), "");
        assert!(decoded.payload().is_empty());
    }

    #[test]
    fn encode_rejects_empty_destination_when_required() {
        let m = Message::without_destination(MessageType::Subscribe, Vec::new());
        let mut codec = SmqCodec::new();
        let mut buf = Vec::new();
        assert!(matches!(
            codec.encode(&m, &mut buf),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut codec = SmqCodec::new();
        let mut cursor = Cursor::new(b"XXXX".to_vec());
        assert!(matches!(
            codec.decode(&mut cursor),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut codec = SmqCodec::new();
        let mut bytes = MAGIC.to_vec();
        bytes.push(200);
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            codec.decode(&mut cursor),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn decode_reports_connection_closed_on_immediate_eof() {
        let mut codec = SmqCodec::new();
        let mut cursor = Cursor::new(Vec::new());
        assert!(matches!(
            codec.decode(&mut cursor),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn decode_rejects_oversized_payload_declaration() {
        let mut codec = SmqCodec::new();
        let mut bytes = MAGIC.to_vec();
        bytes.push(MessageType::Message as u8);
        bytes.push(0); // no headers
        bytes.push(1);
        bytes.push(b'q');
        bytes.extend_from_slice(&((MAX_PAYLOAD_LEN as u32) + 1).to_le_bytes());
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            codec.decode(&mut cursor),
            Err(ProtocolError::LimitExceeded { .. })
        ));
    }
}
