// SPDX-License-Identifier: MIT

//! The message envelope that flows between connections, the registry, and
//! storage.
//!
//! A [`Message`] is immutable once it leaves the codec: it is wrapped in an
//! `Arc` at the point of decode and handed to every interested subscriber's
//! send queue without copying the payload.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Frame type, in the exact discriminant order used by the wire codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    Disconnect = 2,
    Subscribe = 3,
    Unsubscribe = 4,
    Ping = 5,
    Message = 6,
    ConnectAck = 7,
    SubscribeAck = 8,
    PublishAck = 9,
    UnsubscribeAck = 10,
    PingAck = 11,
}

impl MessageType {
    /// Decode a wire byte into a known message type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::Connect,
            2 => Self::Disconnect,
            3 => Self::Subscribe,
            4 => Self::Unsubscribe,
            5 => Self::Ping,
            6 => Self::Message,
            7 => Self::ConnectAck,
            8 => Self::SubscribeAck,
            9 => Self::PublishAck,
            10 => Self::UnsubscribeAck,
            11 => Self::PingAck,
            _ => return None,
        })
    }

    /// True for the three frame types that carry a mandatory destination.
    pub fn requires_destination(self) -> bool {
        matches!(self, Self::Subscribe | Self::Unsubscribe | Self::Message)
    }
}

/// Case-sensitive string-to-string header map. Values are arbitrary UTF-8,
/// capped at 65,535 bytes each by the wire codecs.
pub type Headers = HashMap<String, String>;

/// An immutable-once-framed envelope.
///
/// `created` is stamped at construction time from the wall clock,
/// millisecond precision, matching the original `DateTime("now")` behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    msg_type: MessageType,
    destination: String,
    headers: Headers,
    created: u64,
    payload: Vec<u8>,
}

impl Message {
    /// Construct a new message with an explicit creation timestamp.
    ///
    /// This is used by the codec and by tests that need deterministic
    /// timestamps; [`Message::new`] is the normal entry point.
    pub fn with_created(
        msg_type: MessageType,
        destination: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        created: u64,
    ) -> Self {
        Self {
            msg_type,
            destination: destination.into(),
            headers: Headers::new(),
            created,
            payload: payload.into(),
        }
    }

    /// Construct a new message, stamping `created` from the wall clock.
    pub fn new(
        msg_type: MessageType,
        destination: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self::with_created(msg_type, destination, payload, now_millis())
    }

    /// Construct a message with no destination (CONNECT, PING, and the ACK
    /// types never carry one).
    pub fn without_destination(msg_type: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(msg_type, String::new(), payload)
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.destination = destination.into();
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }
}

/// Milliseconds since the Unix epoch, saturating on clock errors rather than
/// panicking (a message timestamp is diagnostic, never load-bearing for
/// correctness).
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_roundtrips_through_u8() {
        for t in [
            MessageType::Connect,
            MessageType::Disconnect,
            MessageType::Subscribe,
            MessageType::Unsubscribe,
            MessageType::Ping,
            MessageType::Message,
            MessageType::ConnectAck,
            MessageType::SubscribeAck,
            MessageType::PublishAck,
            MessageType::UnsubscribeAck,
            MessageType::PingAck,
        ] {
            assert_eq!(MessageType::from_u8(t as u8), Some(t));
        }
        assert_eq!(MessageType::from_u8(0), None);
        assert_eq!(MessageType::from_u8(200), None);
    }

    #[test]
    fn requires_destination_matches_spec() {
        assert!(MessageType::Subscribe.requires_destination());
        assert!(MessageType::Unsubscribe.requires_destination());
        assert!(MessageType::Message.requires_destination());
        assert!(!MessageType::Ping.requires_destination());
        assert!(!MessageType::Connect.requires_destination());
        assert!(!MessageType::ConnectAck.requires_destination());
    }

    #[test]
    fn headers_are_case_sensitive() {
        let mut m = Message::new(MessageType::Message, "q/1", b"hi".to_vec());
        m.set_header("Content-Type", "text/plain");
        assert_eq!(m.header("Content-Type"), Some("text/plain"));
        assert_eq!(m.header("content-type"), None);
    }
}
