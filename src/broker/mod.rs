// SPDX-License-Identifier: MIT

//! The broker: accepts connections, runs the per-connection protocol state
//! machine, persists published messages, and fans them out through the
//! [`Registry`](crate::registry::Registry) (spec.md §4.5).

pub mod connection;
pub mod listener;
pub mod sendqueue;
pub mod worker_pool;

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::codec::{Codec, SmqCodec};
use crate::config::ListenerConfig;
use crate::message::{Message, MessageType};
use crate::registry::Registry;
use crate::storage::{self, Handle};

pub use connection::{Connection, ConnectionEvents, ConnectionState};
pub use worker_pool::WorkerPool;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),
}

/// Ambient observability counters, carried regardless of spec.md's
/// Non-goals around a full metrics surface: a broker without any way to
/// see dropped messages or rejected publishes is not production shaped.
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    pub connections_accepted: AtomicU64,
    pub connections_closed: AtomicU64,
    pub messages_published: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub publish_rejected_storage_full: AtomicU64,
    pub slow_consumer_drops: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerMetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub publish_rejected_storage_full: u64,
    pub slow_consumer_drops: u64,
}

impl BrokerMetrics {
    pub fn snapshot(&self) -> BrokerMetricsSnapshot {
        BrokerMetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            publish_rejected_storage_full: self.publish_rejected_storage_full.load(Ordering::Relaxed),
            slow_consumer_drops: self.slow_consumer_drops.load(Ordering::Relaxed),
        }
    }
}

/// Messages recovered from storage whose destination had no subscriber at
/// load time, or at publish time. Kept until a subscriber shows up, per
/// spec.md §4.5's recovery-scan-on-subscribe behavior.
type PendingByDestination = HashMap<String, Vec<(Handle, Arc<Message>)>>;

pub struct Broker {
    config: ListenerConfig,
    registry: Arc<Registry>,
    storage: Arc<storage::Engine>,
    worker_pool: Arc<WorkerPool>,
    metrics: Arc<BrokerMetrics>,
    connections: Mutex<HashMap<u64, Connection>>,
    pending: Mutex<PendingByDestination>,
}

impl Broker {
    /// Open storage at the configured directory (using the listener's bind
    /// address as the object name) and rehydrate any messages left over
    /// from a previous run.
    pub fn open(config: ListenerConfig) -> Result<Arc<Self>, BrokerError> {
        config.validate()?;

        let object_name = sanitize_object_name(&config.bind);
        let storage = Arc::new(storage::Engine::open(
            &config.storage.directory,
            object_name,
            config.storage.bucket_size,
        )?);

        let worker_pool = WorkerPool::new(config.workers);
        let metrics = Arc::new(BrokerMetrics::default());
        let registry = Arc::new(Registry::new());

        let broker = Arc::new(Self {
            config,
            registry,
            storage,
            worker_pool,
            metrics,
            connections: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        });

        broker.rehydrate();
        Ok(broker)
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<storage::Engine> {
        &self.storage
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.worker_pool
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }

    pub fn authenticate(&self, user: &str, secret: &str) -> bool {
        user == self.config.auth.user && secret == self.config.auth.secret
    }

    pub fn register_connection(&self, connection: Connection) {
        self.connections.lock().insert(connection.id(), connection);
        self.metrics.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn forget_connection(&self, connection_id: u64) {
        self.connections.lock().remove(&connection_id);
    }

    /// Re-load every bucket file on disk and either deliver recovered
    /// messages to already-subscribed destinations or hold them pending.
    fn rehydrate(&self) {
        for (handle, bytes) in self.storage.load() {
            match decode_envelope(&bytes) {
                Ok(message) => self.reintroduce(handle, Arc::new(message)),
                Err(e) => {
                    tracing::warn!(?handle, error = %e, "dropping unrecoverable stored record");
                    let _ = self.storage.free(handle);
                }
            }
        }
    }

    fn reintroduce(&self, handle: Handle, message: Arc<Message>) {
        let destination = message.destination().to_string();
        if self.registry.subscriber_count(&destination) > 0 {
            let delivered = self.registry.deliver(&destination, message);
            self.metrics.messages_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
            let _ = self.storage.free(handle);
        } else {
            self.pending.lock().entry(destination).or_default().push((handle, message));
        }
    }

    /// Handle a MESSAGE frame from a connected client: persist, deliver to
    /// current subscribers, and leave undelivered copies pending.
    pub fn publish(&self, message: Message) -> Result<(), storage::StorageError> {
        let envelope = encode_envelope(&message)?;
        let handle = match self.storage.insert(&envelope) {
            Ok(handle) => handle,
            Err(e) => {
                self.metrics.publish_rejected_storage_full.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.metrics.messages_published.fetch_add(1, Ordering::Relaxed);

        let destination = message.destination().to_string();
        let message = Arc::new(message);
        let delivered = self.registry.deliver(&destination, message.clone());
        self.metrics.messages_delivered.fetch_add(delivered as u64, Ordering::Relaxed);

        if delivered > 0 {
            let _ = self.storage.free(handle);
        } else {
            self.pending.lock().entry(destination).or_default().push((handle, message));
        }
        Ok(())
    }

    /// Called after a connection subscribes to `destination`: deliver any
    /// messages that were pending because no one was subscribed yet.
    pub fn recover_pending(&self, destination: &str) {
        let pending = self.pending.lock().remove(destination);
        let Some(pending) = pending else { return };
        for (handle, message) in pending {
            let delivered = self.registry.deliver(destination, message);
            self.metrics.messages_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
            let _ = self.storage.free(handle);
        }
    }

    /// Drain every connection's send queue up to `drain.timeouts` and stop
    /// accepting new work. Unsent messages beyond the deadline are
    /// discarded, matching spec.md §5's shutdown sequence.
    pub fn shutdown(&self) {
        let deadline = std::time::Instant::now() + self.config.timeouts.drain_duration();
        loop {
            let still_draining = self
                .connections
                .lock()
                .values()
                .any(|c| c.send_queue_len() > 0);
            if !still_draining || std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let _ = self.storage.flush();
    }
}

impl ConnectionEvents for Broker {
    fn on_connection_closed(&self, connection_id: u64, last_will: Option<(String, Vec<u8>)>, _graceful: bool) {
        self.registry.clear_connection(connection_id);
        self.forget_connection(connection_id);
        if let Some((destination, payload)) = last_will {
            let message = Message::new(MessageType::Message, destination, payload);
            if let Err(e) = self.publish(message) {
                tracing::warn!(connection_id, error = %e, "failed to publish last-will message");
            }
        }
    }
}

/// Storage persists the SMQ wire encoding of a message regardless of which
/// codec the listener speaks on the network; it is an internal envelope
/// format, not the listener's protocol.
fn encode_envelope(message: &Message) -> Result<Vec<u8>, storage::StorageError> {
    let mut buf = Vec::new();
    SmqCodec::new()
        .encode(message, &mut buf)
        .map_err(|e| storage::StorageError::InvalidConfig(format!("failed to encode stored envelope: {e}")))?;
    Ok(buf)
}

fn decode_envelope(bytes: &[u8]) -> Result<Message, crate::codec::ProtocolError> {
    let mut cursor = Cursor::new(bytes);
    SmqCodec::new().decode(&mut cursor)
}

fn sanitize_object_name(bind: &str) -> String {
    bind.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, Protocol, SendQueueConfig, StorageConfig, TimeoutsConfig};
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> ListenerConfig {
        ListenerConfig {
            protocol: Protocol::Smq,
            bind: "127.0.0.1:19999".into(),
            auth: AuthConfig { user: "u".into(), secret: "s".into() },
            storage: StorageConfig { directory: dir.to_string_lossy().into_owned(), bucket_size: 24 + 256 * 8 },
            workers: 1,
            send_queue: SendQueueConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }

    #[test]
    fn publish_with_no_subscribers_stays_pending_then_delivers_on_recover() {
        let dir = tempdir().unwrap();
        let broker = Broker::open(test_config(dir.path())).unwrap();

        broker
            .publish(Message::new(MessageType::Message, "q/durable", b"keep-1".to_vec()))
            .unwrap();
        assert_eq!(broker.metrics().snapshot().messages_published, 1);
        assert_eq!(broker.metrics().snapshot().messages_delivered, 0);

        struct Collector(Mutex<Vec<Arc<Message>>>);
        impl crate::registry::Subscriber for Collector {
            fn connection_id(&self) -> u64 { 1 }
            fn enqueue(&self, message: Arc<Message>) { self.0.lock().push(message); }
        }
        let collector = Arc::new(Collector(Mutex::new(Vec::new())));
        broker.registry().subscribe(collector.clone(), &["q/durable"]);
        broker.recover_pending("q/durable");

        assert_eq!(collector.0.lock().len(), 1);
        assert_eq!(collector.0.lock()[0].payload(), b"keep-1");
        assert_eq!(broker.metrics().snapshot().messages_delivered, 1);
    }

    #[test]
    fn rehydrates_pending_messages_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let broker = Broker::open(test_config(dir.path())).unwrap();
            broker
                .publish(Message::new(MessageType::Message, "q/durable", b"keep-1".to_vec()))
                .unwrap();
            broker.storage().flush().unwrap();
        }

        let reopened = Broker::open(test_config(dir.path())).unwrap();
        struct Collector(Mutex<Vec<Arc<Message>>>);
        impl crate::registry::Subscriber for Collector {
            fn connection_id(&self) -> u64 { 2 }
            fn enqueue(&self, message: Arc<Message>) { self.0.lock().push(message); }
        }
        let collector = Arc::new(Collector(Mutex::new(Vec::new())));
        reopened.registry().subscribe(collector.clone(), &["q/durable"]);
        reopened.recover_pending("q/durable");

        assert_eq!(collector.0.lock().len(), 1);
        assert_eq!(collector.0.lock()[0].payload(), b"keep-1");
    }

    #[test]
    fn authenticate_checks_configured_credentials() {
        let dir = tempdir().unwrap();
        let broker = Broker::open(test_config(dir.path())).unwrap();
        assert!(broker.authenticate("u", "s"));
        assert!(!broker.authenticate("u", "wrong"));
    }
}
