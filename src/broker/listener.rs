// SPDX-License-Identifier: MIT

//! TCP accept loop and the per-connection reader state machine (spec.md
//! §4.5). One thread accepts connections; each accepted connection gets its
//! own reader thread that owns the decode half of the codec and drives the
//! ACCEPTED → AUTHENTICATING → CONNECTED → DISCONNECTING → CLOSED states.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Socket, Type};

use crate::codec::ProtocolError;
use crate::message::{Message, MessageType};
use crate::transport::ByteStream;

use super::connection::{make_codec, Connection, ConnectionState};
use super::{Broker, BrokerError};

pub struct Listener {
    broker: Arc<Broker>,
    accepting: Arc<AtomicBool>,
}

/// Bind via `socket2` rather than `TcpListener::bind` directly so
/// `SO_REUSEADDR` can be set before the listen backlog is established — a
/// broker restarted right after a crash would otherwise fail to rebind a
/// socket still in `TIME_WAIT`.
fn bind_reusable(addr: &str) -> std::io::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid bind address"))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

impl Listener {
    pub fn bind(broker: Arc<Broker>) -> Result<(Self, TcpListener), BrokerError> {
        let tcp = bind_reusable(&broker.config().bind).map_err(BrokerError::Bind)?;
        Ok((
            Self {
                broker,
                accepting: Arc::new(AtomicBool::new(true)),
            },
            tcp,
        ))
    }

    /// Stop accepting new connections. Existing connections are unaffected;
    /// call [`Broker::shutdown`] separately to drain them.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Run the accept loop on the calling thread until `stop_accepting` is
    /// called or the socket errors out.
    pub fn serve(&self, tcp: TcpListener) {
        for stream in tcp.incoming() {
            if !self.accepting.load(Ordering::SeqCst) {
                break;
            }
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let reader_socket = match stream.try_clone() {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to clone accepted socket");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let _ = reader_socket.set_read_timeout(Some(self.broker.config().timeouts.idle_duration()));

            let connection = Connection::new(
                Box::new(stream),
                self.broker.config().protocol,
                self.broker.config().send_queue.high_water,
                self.broker.worker_pool().clone(),
                self.broker.metrics().clone(),
                self.broker.clone(),
            );
            self.broker.register_connection(connection.clone());

            let broker = self.broker.clone();
            let reader: Box<dyn ByteStream> = Box::new(reader_socket);
            std::thread::spawn(move || run_reader_loop(broker, connection, reader));
        }
    }
}

fn run_reader_loop(broker: Arc<Broker>, connection: Connection, mut reader: Box<dyn ByteStream>) {
    let mut codec = make_codec(broker.config().protocol);
    connection.set_state(ConnectionState::Accepted);

    loop {
        let message = match codec.decode(&mut *reader) {
            Ok(m) => m,
            Err(ProtocolError::ConnectionClosed) => {
                handle_disconnect(&connection);
                return;
            }
            Err(e) => {
                tracing::debug!(connection_id = connection.id(), error = %e, "protocol error, closing connection");
                handle_disconnect(&connection);
                return;
            }
        };

        match connection.state() {
            ConnectionState::Accepted => {
                connection.set_state(ConnectionState::Authenticating);
                handle_connect(&broker, &connection, message);
                if connection.state() == ConnectionState::Closed {
                    return;
                }
            }
            ConnectionState::Authenticating | ConnectionState::Connected => {
                if !handle_connected_frame(&broker, &connection, message) {
                    return;
                }
            }
            ConnectionState::Disconnecting | ConnectionState::Closed => return,
        }
    }
}

fn handle_connect(broker: &Arc<Broker>, connection: &Connection, message: Message) {
    if message.msg_type() != MessageType::Connect {
        tracing::debug!(connection_id = connection.id(), "first frame was not CONNECT");
        connection.close(false);
        return;
    }

    let user = message.header("username").unwrap_or_default();
    let secret = message.header("password").unwrap_or_default();

    if !broker.authenticate(user, secret) {
        let mut ack = Message::without_destination(MessageType::ConnectAck, Vec::new());
        ack.set_header("success", "0");
        if let Err(e) = connection.send_now(&ack) {
            tracing::debug!(connection_id = connection.id(), error = %e, "failed to write CONNECT_ACK reject");
        }
        connection.close(false);
        return;
    }

    connection.set_client_id(message.header("client_id").unwrap_or_default().to_string());
    if let Some(destination) = message.header("will_topic") {
        if !destination.is_empty() {
            let payload = message.header("will_payload").unwrap_or("").as_bytes().to_vec();
            connection.set_last_will(destination.to_string(), payload);
        }
    }
    connection.set_state(ConnectionState::Connected);

    let mut ack = Message::without_destination(MessageType::ConnectAck, Vec::new());
    ack.set_header("success", "1");
    connection.send(std::sync::Arc::new(ack));
}

/// Returns `false` if the reader loop should stop.
fn handle_connected_frame(broker: &Arc<Broker>, connection: &Connection, message: Message) -> bool {
    match message.msg_type() {
        MessageType::Subscribe => {
            let destination = message.destination().to_string();
            broker.registry().subscribe(Arc::new(connection.clone()), &[&destination]);
            broker.recover_pending(&destination);
            let mut ack = Message::without_destination(MessageType::SubscribeAck, Vec::new());
            ack.set_header("success", "1");
            connection.send(Arc::new(ack));
            true
        }
        MessageType::Unsubscribe => {
            broker.registry().unsubscribe(connection.id(), message.destination());
            let mut ack = Message::without_destination(MessageType::UnsubscribeAck, Vec::new());
            ack.set_header("success", "1");
            connection.send(Arc::new(ack));
            true
        }
        MessageType::Message => {
            let success = broker.publish(message).is_ok();
            let mut ack = Message::without_destination(MessageType::PublishAck, Vec::new());
            ack.set_header("success", if success { "1" } else { "0" });
            connection.send(Arc::new(ack));
            true
        }
        MessageType::Ping => {
            connection.send(Arc::new(Message::without_destination(MessageType::PingAck, Vec::new())));
            true
        }
        MessageType::Disconnect => {
            connection.set_state(ConnectionState::Disconnecting);
            connection.close(true);
            false
        }
        other => {
            tracing::debug!(connection_id = connection.id(), msg_type = ?other, "unexpected frame type in CONNECTED state");
            true
        }
    }
}

fn handle_disconnect(connection: &Connection) {
    connection.set_state(ConnectionState::Disconnecting);
    connection.close(false);
}
