// SPDX-License-Identifier: MIT

//! Minimal client-side control surface (spec.md §6), used by integration
//! tests and available to any caller that wants to talk to a listener
//! without hand-rolling the wire protocol.
//!
//! Requests and replies are matched by protocol ordering, not a correlation
//! id: a [`Client`] issues one request at a time and waits for the next ack
//! frame, which is how the broker's state machine replies (spec.md §4.5).

use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use thiserror::Error;

use crate::codec::{Codec, MqttCodec, ProtocolError, SmqCodec};
use crate::config::Protocol;
use crate::message::{Message, MessageType};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("broker rejected the request")]
    Rejected,

    #[error("timed out waiting for a reply")]
    Timeout,
}

fn make_codec(protocol: Protocol) -> Box<dyn Codec> {
    match protocol {
        Protocol::Smq => Box::new(SmqCodec::new()),
        Protocol::Mqtt => Box::new(MqttCodec::new()),
    }
}

pub struct Client {
    writer: Mutex<TcpStream>,
    encode_codec: Mutex<Box<dyn Codec>>,
    acks: Receiver<Message>,
    messages: Receiver<Message>,
    buffered_message: Mutex<Option<Message>>,
}

impl Client {
    /// Connect, authenticate, and block until the broker's CONNECT_ACK
    /// arrives or `timeout` elapses.
    pub fn connect(
        protocol: Protocol,
        host: &str,
        user: &str,
        secret: &str,
        clean_session: bool,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(host)?;
        stream.set_nodelay(true)?;
        let reader_stream = stream.try_clone()?;

        let (ack_tx, ack_rx) = channel::unbounded();
        let (msg_tx, msg_rx) = channel::unbounded();
        spawn_reader(reader_stream, protocol, ack_tx, msg_tx);

        let client = Self {
            writer: Mutex::new(stream),
            encode_codec: Mutex::new(make_codec(protocol)),
            acks: ack_rx,
            messages: msg_rx,
            buffered_message: Mutex::new(None),
        };

        let mut connect = Message::without_destination(MessageType::Connect, Vec::new());
        connect.set_header("client_id", format!("smq-client-{}", std::process::id()));
        connect.set_header("username", user);
        connect.set_header("password", secret);
        connect.set_header("clean_session", if clean_session { "1" } else { "0" });
        client.write(&connect)?;

        let ack = client.wait_ack(timeout)?;
        if ack.header("success") != Some("1") {
            return Err(ClientError::Rejected);
        }
        Ok(client)
    }

    pub fn subscribe(&self, destination: &str, timeout: Duration) -> Result<(), ClientError> {
        self.write(&Message::new(MessageType::Subscribe, destination, Vec::new()))?;
        let ack = self.wait_ack(timeout)?;
        if ack.header("success") != Some("1") {
            return Err(ClientError::Rejected);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, destination: &str, timeout: Duration) -> Result<(), ClientError> {
        self.write(&Message::new(MessageType::Unsubscribe, destination, Vec::new()))?;
        self.wait_ack(timeout)?;
        Ok(())
    }

    pub fn send(&self, destination: &str, payload: &[u8], timeout: Duration) -> Result<(), ClientError> {
        self.write(&Message::new(MessageType::Message, destination, payload.to_vec()))?;
        let ack = self.wait_ack(timeout)?;
        if ack.header("success") != Some("1") {
            return Err(ClientError::Rejected);
        }
        Ok(())
    }

    pub fn disconnect(&self, graceful: bool) -> Result<(), ClientError> {
        if graceful {
            self.write(&Message::without_destination(MessageType::Disconnect, Vec::new()))?;
        }
        self.writer.lock().unwrap().shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }

    pub fn has_messages(&self) -> bool {
        let mut buffered = self.buffered_message.lock().unwrap();
        if buffered.is_some() {
            return true;
        }
        match self.messages.try_recv() {
            Ok(message) => {
                *buffered = Some(message);
                true
            }
            Err(_) => false,
        }
    }

    pub fn receive(&self, timeout: Duration) -> Result<Message, ClientError> {
        if let Some(message) = self.buffered_message.lock().unwrap().take() {
            return Ok(message);
        }
        match self.messages.recv_timeout(timeout) {
            Ok(message) => Ok(message),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionAborted,
            ))),
        }
    }

    fn write(&self, message: &Message) -> Result<(), ClientError> {
        let mut codec = self.encode_codec.lock().unwrap();
        let mut writer = self.writer.lock().unwrap();
        codec.encode(message, &mut *writer)?;
        Ok(())
    }

    fn wait_ack(&self, timeout: Duration) -> Result<Message, ClientError> {
        match self.acks.recv_timeout(timeout) {
            Ok(message) => Ok(message),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionAborted,
            ))),
        }
    }
}

fn spawn_reader(
    mut stream: TcpStream,
    protocol: Protocol,
    acks: channel::Sender<Message>,
    messages: channel::Sender<Message>,
) {
    std::thread::spawn(move || {
        let mut codec = make_codec(protocol);
        loop {
            match codec.decode(&mut stream) {
                Ok(message) => {
                    let channel = match message.msg_type() {
                        MessageType::Message => &messages,
                        _ => &acks,
                    };
                    if channel.send(message).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    });
}
