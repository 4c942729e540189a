// SPDX-License-Identifier: MIT

//! Per-connection state and the outbound half of the protocol pipeline.
//!
//! Reading happens on a dedicated thread per connection (spawned by
//! [`super::listener`]) that owns the connection's `decode` codec instance
//! exclusively. Writing happens on worker-pool threads draining the send
//! queue; those share an `encode` codec instance and the write half of the
//! socket behind mutexes, but the send queue's processing flag already
//! guarantees only one drain task runs per connection at a time (spec.md
//! §4.5), so the mutexes never see contention in the common case.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::{Codec, ProtocolError};
use crate::config::Protocol;
use crate::message::Message;
use crate::registry::Subscriber;
use crate::transport::ByteStream;

use super::sendqueue::SendQueue;
use super::worker_pool::WorkerPool;
use super::BrokerMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Authenticating,
    Connected,
    Disconnecting,
    Closed,
}

/// Callbacks the broker implements so a connection can trigger
/// registry/storage cleanup without owning the broker directly.
pub trait ConnectionEvents: Send + Sync {
    /// The connection is tearing down: clear its subscriptions and, if a
    /// last-will is registered and `graceful` is false, publish it.
    fn on_connection_closed(&self, connection_id: u64, last_will: Option<(String, Vec<u8>)>, graceful: bool);
}

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

struct Shared {
    writer: Mutex<Box<dyn ByteStream>>,
    encode_codec: Mutex<Box<dyn Codec>>,
    send_queue: SendQueue,
    worker_pool: Arc<WorkerPool>,
    state: Mutex<ConnectionState>,
    client_id: Mutex<String>,
    last_will: Mutex<Option<(String, Vec<u8>)>>,
    metrics: Arc<BrokerMetrics>,
    events: Arc<dyn ConnectionEvents>,
}

/// A cheaply-cloneable handle to one accepted connection.
#[derive(Clone)]
pub struct Connection {
    id: u64,
    shared: Arc<Shared>,
}

pub fn make_codec(protocol: Protocol) -> Box<dyn Codec> {
    match protocol {
        Protocol::Smq => Box::new(crate::codec::SmqCodec::new()),
        Protocol::Mqtt => Box::new(crate::codec::MqttCodec::new()),
    }
}

impl Connection {
    pub fn new(
        writer: Box<dyn ByteStream>,
        protocol: Protocol,
        high_water: usize,
        worker_pool: Arc<WorkerPool>,
        metrics: Arc<BrokerMetrics>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed) as u64;
        Self {
            id,
            shared: Arc::new(Shared {
                writer: Mutex::new(writer),
                encode_codec: Mutex::new(make_codec(protocol)),
                send_queue: SendQueue::new(high_water),
                worker_pool,
                state: Mutex::new(ConnectionState::Accepted),
                client_id: Mutex::new(String::new()),
                last_will: Mutex::new(None),
                metrics,
                events,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.shared.state.lock() = state;
    }

    pub fn client_id(&self) -> String {
        self.shared.client_id.lock().clone()
    }

    pub fn set_client_id(&self, client_id: String) {
        *self.shared.client_id.lock() = client_id;
    }

    pub fn set_last_will(&self, destination: String, payload: Vec<u8>) {
        *self.shared.last_will.lock() = Some((destination, payload));
    }

    pub fn take_last_will(&self) -> Option<(String, Vec<u8>)> {
        self.shared.last_will.lock().take()
    }

    pub fn send_queue_len(&self) -> usize {
        self.shared.send_queue.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.send_queue.dropped_count()
    }

    /// Queue `message` for transmission, submitting a drain task to the
    /// worker pool if this push is the one that flips the queue from idle
    /// to processing.
    pub fn send(&self, message: Arc<Message>) {
        if self.shared.send_queue.push(message) {
            let connection = self.clone();
            self.shared.worker_pool.submit(move || connection.drain());
        }
    }

    /// Encode and write `message` synchronously, bypassing the send queue.
    /// Spec.md §4.5's CONNECT-reject transition is "emit CONNECT_ACK with
    /// failure code; close socket", an ordered pair — the caller needs the
    /// write to have happened before it tears the socket down, which the
    /// normal async `send` (queued for a worker-pool drain task) cannot
    /// guarantee.
    pub fn send_now(&self, message: &Message) -> Result<(), ProtocolError> {
        let mut codec = self.shared.encode_codec.lock();
        let mut writer = self.shared.writer.lock();
        codec.encode(message, &mut *writer)
    }

    /// Drain the send queue until empty, encoding and writing each message.
    /// A write error closes the connection; it does not poison the worker.
    fn drain(&self) {
        while let Some(message) = self.shared.send_queue.pop() {
            let mut codec = self.shared.encode_codec.lock();
            let mut writer = self.shared.writer.lock();
            if let Err(e) = codec.encode(&message, &mut *writer) {
                tracing::warn!(connection_id = self.id, error = %e, "failed to write outbound frame, closing connection");
                drop(writer);
                drop(codec);
                self.close(false);
                return;
            }
        }
    }

    /// Tear the connection down: mark it closed, notify the broker so it
    /// can clear subscriptions and (if ungraceful) apply the last-will, and
    /// shut down the socket.
    pub fn close(&self, graceful: bool) {
        let already_closed = {
            let mut state = self.shared.state.lock();
            let was_closed = *state == ConnectionState::Closed;
            *state = ConnectionState::Closed;
            was_closed
        };
        if already_closed {
            return;
        }

        // A graceful DISCONNECT suppresses the last-will (spec.md open
        // question, resolved in favor of MQTT semantics); still drain it so
        // a later close of the same connection can't resurrect it.
        let recorded_will = self.take_last_will();
        let last_will = if graceful { None } else { recorded_will };
        self.shared.events.on_connection_closed(self.id, last_will, graceful);
        self.shared.metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self.shared.writer.lock().shutdown(std::net::Shutdown::Both);
    }
}

impl Subscriber for Connection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn enqueue(&self, message: Arc<Message>) {
        self.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerMetrics;
    use crate::message::MessageType;
    use crate::transport::test_support::MockStream;

    struct NoopEvents;
    impl ConnectionEvents for NoopEvents {
        fn on_connection_closed(&self, _connection_id: u64, _last_will: Option<(String, Vec<u8>)>, _graceful: bool) {}
    }

    #[test]
    fn send_drains_through_worker_pool() {
        let (_client_end, server_end) = MockStream::pair();
        let pool = WorkerPool::new(1);
        let metrics = Arc::new(BrokerMetrics::default());
        let connection = Connection::new(
            Box::new(server_end),
            Protocol::Smq,
            10,
            pool,
            metrics,
            Arc::new(NoopEvents),
        );

        let message = Arc::new(Message::new(MessageType::Message, "q/1", b"hi".to_vec()));
        connection.send(message);

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(connection.send_queue_len(), 0);
    }

    #[test]
    fn send_now_writes_before_returning() {
        let (client_end, server_end) = MockStream::pair();
        let pool = WorkerPool::new(1);
        let metrics = Arc::new(BrokerMetrics::default());
        let connection = Connection::new(
            Box::new(server_end),
            Protocol::Smq,
            10,
            pool,
            metrics,
            Arc::new(NoopEvents),
        );

        let mut ack = Message::without_destination(MessageType::ConnectAck, Vec::new());
        ack.set_header("success", "0");
        connection.send_now(&ack).unwrap();
        connection.close(false);

        let mut reader = client_end;
        let mut codec = crate::codec::SmqCodec::new();
        let decoded = codec.decode(&mut reader).unwrap();
        assert_eq!(decoded.msg_type(), MessageType::ConnectAck);
        assert_eq!(decoded.header("success"), Some("0"));
    }

    #[test]
    fn close_is_idempotent_and_notifies_once() {
        let (_client_end, server_end) = MockStream::pair();
        let pool = WorkerPool::new(1);
        let metrics = Arc::new(BrokerMetrics::default());
        let connection = Connection::new(
            Box::new(server_end),
            Protocol::Smq,
            10,
            pool,
            metrics,
            Arc::new(NoopEvents),
        );

        connection.close(true);
        connection.close(true);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
