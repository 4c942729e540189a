// SPDX-License-Identifier: MIT

//! Pluggable wire protocol: turns a byte stream into [`Message`]s and back.
//!
//! A listener picks one [`Codec`] implementation at construction and uses it
//! for every connection it accepts (spec.md §4.3). Reads are blocking: a
//! codec's `decode` call reads directly off the connection's stream and
//! returns only once a full frame (or an unambiguous error) is available,
//! matching the broker's thread-per-connection model (spec.md §5).

pub mod mqtt_wire;
pub mod smq_wire;

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::message::Message;

pub use mqtt_wire::MqttCodec;
pub use smq_wire::SmqCodec;

/// Maximum MESSAGE payload accepted by either codec (spec.md §4.3.1).
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("declared length {declared} exceeds limit {limit}")]
    LimitExceeded { declared: usize, limit: usize },

    #[error("connection closed mid-frame")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Translate a read failure into the codec's closed/malformed
    /// distinction: EOF before any byte of a frame is read is normal
    /// connection teardown, not a protocol violation.
    fn from_read_error(e: io::Error, bytes_read: usize) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof && bytes_read == 0 {
            ProtocolError::ConnectionClosed
        } else {
            ProtocolError::Io(e)
        }
    }
}

/// A wire protocol: symmetric encode/decode between bytes and [`Message`].
pub trait Codec: Send {
    /// Decode exactly one frame, blocking until it is fully read.
    /// Returns [`ProtocolError::ConnectionClosed`] if the stream ends before
    /// any byte of a new frame arrives.
    fn decode(&mut self, reader: &mut dyn Read) -> Result<Message, ProtocolError>;

    /// Encode one message and write it to `writer`.
    fn encode(&mut self, message: &Message, writer: &mut dyn Write) -> Result<(), ProtocolError>;
}

/// Read exactly `buf.len()` bytes, distinguishing a clean EOF before any
/// byte was read (connection closed) from a short read mid-frame
/// (protocol/connection error either way, but the former is not logged as
/// malformed).
pub(crate) fn read_exact_tracked(reader: &mut dyn Read, buf: &mut [u8]) -> Result<(), ProtocolError> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => {
                return Err(ProtocolError::from_read_error(
                    io::Error::from(io::ErrorKind::UnexpectedEof),
                    read,
                ))
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::from_read_error(e, read)),
        }
    }
    Ok(())
}
