// SPDX-License-Identifier: MIT

//! MQTT 3.1.1 control-packet framing (spec.md §4.3.2), translated to and
//! from the common [`Message`] envelope. Every PUBLISH is treated as QoS 0
//! regardless of the QoS bits the peer sets; CONNACK always reports
//! session-present=false.
//!
//! Because [`Message`] carries a single `destination` string, a SUBSCRIBE
//! or UNSUBSCRIBE packet that bundles several topic filters in one frame is
//! accepted but only its first filter is honored — real MQTT clients send
//! one filter per SUBSCRIBE in the overwhelming common case, and spec.md's
//! client-side control surface (`subscribe(destination, timeout)`) only
//! ever asks for one at a time.

use std::io::{Read, Write};

use crate::message::{Message, MessageType};

use super::{read_exact_tracked, Codec, ProtocolError, MAX_PAYLOAD_LEN};

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

mod packet_type {
    pub const CONNECT: u8 = 1;
    pub const CONNACK: u8 = 2;
    pub const PUBLISH: u8 = 3;
    pub const SUBSCRIBE: u8 = 8;
    pub const SUBACK: u8 = 9;
    pub const UNSUBSCRIBE: u8 = 10;
    pub const UNSUBACK: u8 = 11;
    pub const PINGREQ: u8 = 12;
    pub const PINGRESP: u8 = 13;
    pub const DISCONNECT: u8 = 14;
}

const CONNACK_ACCEPTED: u8 = 0x00;
const CONNACK_NOT_AUTHORIZED: u8 = 0x05;

#[derive(Debug, Default)]
pub struct MqttCodec;

impl MqttCodec {
    pub fn new() -> Self {
        Self
    }
}

fn read_remaining_length(reader: &mut dyn Read) -> Result<usize, ProtocolError> {
    let mut multiplier: usize = 1;
    let mut value: usize = 0;
    for _ in 0..4 {
        let mut byte = [0u8; 1];
        read_exact_tracked(reader, &mut byte)?;
        value += (byte[0] & 0x7F) as usize * multiplier;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }
    Err(ProtocolError::Malformed(
        "remaining-length varint exceeds 4 bytes".into(),
    ))
}

fn write_remaining_length(out: &mut Vec<u8>, mut len: usize) -> Result<(), ProtocolError> {
    if len > 128usize.pow(4) {
        return Err(ProtocolError::LimitExceeded {
            declared: len,
            limit: 128usize.pow(4),
        });
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    Ok(())
}

fn read_utf8_string(body: &[u8], at: &mut usize) -> Result<String, ProtocolError> {
    let len_bytes = body
        .get(*at..*at + 2)
        .ok_or_else(|| ProtocolError::Malformed("truncated UTF-8 string length".into()))?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    *at += 2;
    let bytes = body
        .get(*at..*at + len)
        .ok_or_else(|| ProtocolError::Malformed("truncated UTF-8 string body".into()))?;
    *at += len;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::Malformed("invalid UTF-8 string".into()))
}

fn read_binary(body: &[u8], at: &mut usize) -> Result<Vec<u8>, ProtocolError> {
    let len_bytes = body
        .get(*at..*at + 2)
        .ok_or_else(|| ProtocolError::Malformed("truncated binary length".into()))?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    *at += 2;
    let bytes = body
        .get(*at..*at + len)
        .ok_or_else(|| ProtocolError::Malformed("truncated binary body".into()))?;
    *at += len;
    Ok(bytes.to_vec())
}

fn write_utf8_string(out: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    if s.len() > u16::MAX as usize {
        return Err(ProtocolError::Malformed("string exceeds u16 length".into()));
    }
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_binary(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), ProtocolError> {
    if bytes.len() > u16::MAX as usize {
        return Err(ProtocolError::Malformed("binary field exceeds u16 length".into()));
    }
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn success_header(message: &Message) -> bool {
    message.header("success").map(|v| v != "0").unwrap_or(true)
}

impl Codec for MqttCodec {
    fn decode(&mut self, reader: &mut dyn Read) -> Result<Message, ProtocolError> {
        let mut first = [0u8; 1];
        read_exact_tracked(reader, &mut first)?;
        let packet_type = first[0] >> 4;
        let flags = first[0] & 0x0F;

        let remaining_len = read_remaining_length(reader)?;
        if remaining_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::LimitExceeded {
                declared: remaining_len,
                limit: MAX_PAYLOAD_LEN,
            });
        }
        let mut body = vec![0u8; remaining_len];
        read_exact_tracked(reader, &mut body)?;

        match packet_type {
            packet_type::CONNECT => decode_connect(&body),
            packet_type::PUBLISH => decode_publish(flags, &body),
            packet_type::SUBSCRIBE => decode_subscribe(&body),
            packet_type::UNSUBSCRIBE => decode_unsubscribe(&body),
            packet_type::PINGREQ => Ok(Message::without_destination(MessageType::Ping, Vec::new())),
            packet_type::DISCONNECT => Ok(Message::without_destination(MessageType::Disconnect, Vec::new())),
            packet_type::CONNACK | packet_type::SUBACK | packet_type::UNSUBACK | packet_type::PINGRESP => {
                Err(ProtocolError::Malformed(
                    "broker does not accept server-to-client packet types from a client".into(),
                ))
            }
            other => Err(ProtocolError::Malformed(format!("unknown MQTT packet type {other}"))),
        }
    }

    fn encode(&mut self, message: &Message, writer: &mut dyn Write) -> Result<(), ProtocolError> {
        let out = match message.msg_type() {
            MessageType::Connect => encode_connect(message)?,
            MessageType::Subscribe => encode_subscribe(message)?,
            MessageType::Unsubscribe => encode_unsubscribe(message)?,
            MessageType::Ping => encode_fixed_only(packet_type::PINGREQ),
            MessageType::ConnectAck => encode_connack(message)?,
            MessageType::SubscribeAck => encode_suback(message)?,
            MessageType::UnsubscribeAck => encode_unsuback(message)?,
            MessageType::PublishAck => encode_puback(message)?,
            MessageType::PingAck => encode_fixed_only(packet_type::PINGRESP),
            MessageType::Message => encode_publish(message)?,
            MessageType::Disconnect => encode_fixed_only(packet_type::DISCONNECT),
        };
        writer.write_all(&out)?;
        Ok(())
    }
}

/// Encodes the client->broker half of the handshake — used by
/// [`crate::client::Client`] when it is configured for MQTT, mirroring
/// [`decode_connect`] in reverse. `Client` never registers a will today, so
/// the will fields only appear when the headers that `decode_connect` itself
/// produces are present (e.g. a message replayed from one broker to
/// another).
fn encode_connect(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let client_id = message.header("client_id").unwrap_or_default();
    let username = message.header("username").filter(|v| !v.is_empty());
    let password = message.header("password").filter(|v| !v.is_empty());
    let clean_session = message.header("clean_session").map(|v| v != "0").unwrap_or(true);
    let will_topic = message.header("will_topic").filter(|v| !v.is_empty());
    let will_payload = message.header("will_payload").unwrap_or("");
    let will_qos: u8 = message.header("will_qos").and_then(|v| v.parse().ok()).unwrap_or(0);
    let will_retain = message.header("will_retain").map(|v| v != "0").unwrap_or(false);
    let keep_alive: u16 = message.header("keep_alive").and_then(|v| v.parse().ok()).unwrap_or(60);

    let mut flags = 0u8;
    if clean_session {
        flags |= 0x02;
    }
    if will_topic.is_some() {
        flags |= 0x04;
        flags |= (will_qos & 0x03) << 3;
        if will_retain {
            flags |= 0x20;
        }
    }
    if password.is_some() {
        flags |= 0x40;
    }
    if username.is_some() {
        flags |= 0x80;
    }

    let mut variable = Vec::new();
    write_utf8_string(&mut variable, PROTOCOL_NAME)?;
    variable.push(PROTOCOL_LEVEL);
    variable.push(flags);
    variable.extend_from_slice(&keep_alive.to_be_bytes());
    write_utf8_string(&mut variable, client_id)?;
    if let Some(topic) = will_topic {
        write_utf8_string(&mut variable, topic)?;
        write_binary(&mut variable, will_payload.as_bytes())?;
    }
    if let Some(user) = username {
        write_utf8_string(&mut variable, user)?;
    }
    if let Some(pass) = password {
        write_binary(&mut variable, pass.as_bytes())?;
    }

    let mut out = vec![packet_type::CONNECT << 4];
    write_remaining_length(&mut out, variable.len())?;
    out.extend_from_slice(&variable);
    Ok(out)
}

fn encode_subscribe(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    if message.destination().is_empty() {
        return Err(ProtocolError::Malformed("SUBSCRIBE requires a non-empty topic filter".into()));
    }
    let packet_id: u16 = message.header("mqtt.packet_id").and_then(|v| v.parse().ok()).unwrap_or(1);
    let qos: u8 = message.header("mqtt.qos").and_then(|v| v.parse().ok()).unwrap_or(0);

    let mut variable = Vec::new();
    variable.extend_from_slice(&packet_id.to_be_bytes());
    write_utf8_string(&mut variable, message.destination())?;
    variable.push(qos);

    let mut out = vec![(packet_type::SUBSCRIBE << 4) | 0x02]; // reserved bits, MQTT 3.1.1 §3.8.1
    write_remaining_length(&mut out, variable.len())?;
    out.extend_from_slice(&variable);
    Ok(out)
}

fn encode_unsubscribe(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    if message.destination().is_empty() {
        return Err(ProtocolError::Malformed("UNSUBSCRIBE requires a non-empty topic filter".into()));
    }
    let packet_id: u16 = message.header("mqtt.packet_id").and_then(|v| v.parse().ok()).unwrap_or(1);

    let mut variable = Vec::new();
    variable.extend_from_slice(&packet_id.to_be_bytes());
    write_utf8_string(&mut variable, message.destination())?;

    let mut out = vec![(packet_type::UNSUBSCRIBE << 4) | 0x02]; // reserved bits, MQTT 3.1.1 §3.10.1
    write_remaining_length(&mut out, variable.len())?;
    out.extend_from_slice(&variable);
    Ok(out)
}

fn decode_connect(body: &[u8]) -> Result<Message, ProtocolError> {
    let mut at = 0;
    let protocol_name = read_utf8_string(body, &mut at)?;
    if protocol_name != PROTOCOL_NAME {
        return Err(ProtocolError::Malformed(format!(
            "unexpected protocol name {protocol_name:?}"
        )));
    }
    let level = *body
        .get(at)
        .ok_or_else(|| ProtocolError::Malformed("truncated CONNECT: missing protocol level".into()))?;
    at += 1;
    if level != PROTOCOL_LEVEL {
        return Err(ProtocolError::Malformed(format!("unsupported protocol level {level}")));
    }
    let connect_flags = *body
        .get(at)
        .ok_or_else(|| ProtocolError::Malformed("truncated CONNECT: missing connect flags".into()))?;
    at += 1;
    let keep_alive_bytes = body
        .get(at..at + 2)
        .ok_or_else(|| ProtocolError::Malformed("truncated CONNECT: missing keep-alive".into()))?;
    let keep_alive = u16::from_be_bytes([keep_alive_bytes[0], keep_alive_bytes[1]]);
    at += 2;

    let username_flag = connect_flags & 0x80 != 0;
    let password_flag = connect_flags & 0x40 != 0;
    let will_retain = connect_flags & 0x20 != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_flag = connect_flags & 0x04 != 0;
    let clean_session = connect_flags & 0x02 != 0;

    let client_id = read_utf8_string(body, &mut at)?;

    let mut will_topic = None;
    let mut will_payload = Vec::new();
    if will_flag {
        will_topic = Some(read_utf8_string(body, &mut at)?);
        will_payload = read_binary(body, &mut at)?;
    }
    let username = if username_flag { Some(read_utf8_string(body, &mut at)?) } else { None };
    let password = if password_flag { Some(read_binary(body, &mut at)?) } else { None };

    let mut message = Message::without_destination(MessageType::Connect, Vec::new());
    message.set_header("client_id", client_id);
    message.set_header("clean_session", if clean_session { "1" } else { "0" });
    message.set_header("keep_alive", keep_alive.to_string());
    if let Some(topic) = will_topic {
        message.set_header("will_topic", topic);
        message.set_header("will_qos", will_qos.to_string());
        message.set_header("will_retain", if will_retain { "1" } else { "0" });
        // CONNECT has no payload section on the SMQ wire (only MESSAGE
        // frames do), so the will body travels as a header end to end,
        // the same way `will_topic` does.
        message.set_header("will_payload", String::from_utf8_lossy(&will_payload).into_owned());
    }
    if let Some(user) = username {
        message.set_header("username", user);
    }
    if let Some(pass) = password {
        message.set_header("password", String::from_utf8_lossy(&pass).into_owned());
    }
    Ok(message)
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Message, ProtocolError> {
    let qos = (flags >> 1) & 0x03;
    let mut at = 0;
    let topic = read_utf8_string(body, &mut at)?;
    if topic.is_empty() {
        return Err(ProtocolError::Malformed("PUBLISH topic must not be empty".into()));
    }
    // Every PUBLISH is treated as QoS 0; a QoS>0 packet identifier is read
    // and discarded since the broker never emits a matching PUBACK/PUBREC.
    if qos > 0 {
        body.get(at..at + 2)
            .ok_or_else(|| ProtocolError::Malformed("truncated PUBLISH: missing packet id".into()))?;
        at += 2;
    }
    let payload = body[at..].to_vec();
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::LimitExceeded {
            declared: payload.len(),
            limit: MAX_PAYLOAD_LEN,
        });
    }
    Ok(Message::new(MessageType::Message, topic, payload))
}

fn decode_subscribe(body: &[u8]) -> Result<Message, ProtocolError> {
    let mut at = 0;
    let packet_id_bytes = body
        .get(at..at + 2)
        .ok_or_else(|| ProtocolError::Malformed("truncated SUBSCRIBE: missing packet id".into()))?;
    let packet_id = u16::from_be_bytes([packet_id_bytes[0], packet_id_bytes[1]]);
    at += 2;
    let filter = read_utf8_string(body, &mut at)?;
    let requested_qos = *body
        .get(at)
        .ok_or_else(|| ProtocolError::Malformed("truncated SUBSCRIBE: missing requested QoS".into()))?;
    if filter.is_empty() {
        return Err(ProtocolError::Malformed("SUBSCRIBE filter must not be empty".into()));
    }
    let mut message = Message::new(MessageType::Subscribe, filter, Vec::new());
    message.set_header("mqtt.packet_id", packet_id.to_string());
    message.set_header("mqtt.qos", requested_qos.to_string());
    Ok(message)
}

fn decode_unsubscribe(body: &[u8]) -> Result<Message, ProtocolError> {
    let mut at = 0;
    let packet_id_bytes = body
        .get(at..at + 2)
        .ok_or_else(|| ProtocolError::Malformed("truncated UNSUBSCRIBE: missing packet id".into()))?;
    let packet_id = u16::from_be_bytes([packet_id_bytes[0], packet_id_bytes[1]]);
    at += 2;
    let filter = read_utf8_string(body, &mut at)?;
    if filter.is_empty() {
        return Err(ProtocolError::Malformed("UNSUBSCRIBE filter must not be empty".into()));
    }
    let mut message = Message::new(MessageType::Unsubscribe, filter, Vec::new());
    message.set_header("mqtt.packet_id", packet_id.to_string());
    Ok(message)
}

fn encode_connack(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut out = vec![(packet_type::CONNACK << 4)];
    let return_code = if success_header(message) { CONNACK_ACCEPTED } else { CONNACK_NOT_AUTHORIZED };
    write_remaining_length(&mut out, 2)?;
    out.push(0x00); // session-present is always false
    out.push(return_code);
    Ok(out)
}

fn encode_suback(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let packet_id: u16 = message.header("mqtt.packet_id").and_then(|v| v.parse().ok()).unwrap_or(0);
    let mut out = vec![(packet_type::SUBACK << 4)];
    write_remaining_length(&mut out, 3)?;
    out.extend_from_slice(&packet_id.to_be_bytes());
    out.push(if success_header(message) { 0x00 } else { 0x80 });
    Ok(out)
}

fn encode_unsuback(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let packet_id: u16 = message.header("mqtt.packet_id").and_then(|v| v.parse().ok()).unwrap_or(0);
    let mut out = vec![(packet_type::UNSUBACK << 4)];
    write_remaining_length(&mut out, 2)?;
    out.extend_from_slice(&packet_id.to_be_bytes());
    Ok(out)
}

/// PUBACK is not part of MQTT's QoS-0 flow, but spec.md's broker state
/// machine always emits a PUBLISH_ACK message regardless of transport. We
/// surface it as a PUBACK with packet identifier 0 so the broker's ack
/// contract holds uniformly across codecs.
fn encode_puback(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    const PUBACK: u8 = 4;
    let _ = success_header(message);
    let mut out = vec![(PUBACK << 4)];
    write_remaining_length(&mut out, 2)?;
    out.extend_from_slice(&0u16.to_be_bytes());
    Ok(out)
}

fn encode_publish(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    if message.destination().is_empty() {
        return Err(ProtocolError::Malformed("PUBLISH requires a non-empty topic".into()));
    }
    if message.payload().len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::LimitExceeded {
            declared: message.payload().len(),
            limit: MAX_PAYLOAD_LEN,
        });
    }
    let mut variable_and_payload = Vec::new();
    write_utf8_string(&mut variable_and_payload, message.destination())?;
    variable_and_payload.extend_from_slice(message.payload());

    let mut out = vec![(packet_type::PUBLISH << 4)]; // QoS 0, no DUP/RETAIN
    write_remaining_length(&mut out, variable_and_payload.len())?;
    out.extend_from_slice(&variable_and_payload);
    Ok(out)
}

fn encode_fixed_only(packet_type: u8) -> Vec<u8> {
    vec![packet_type << 4, 0x00]
}
