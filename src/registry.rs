// SPDX-License-Identifier: MIT

//! Subscription registry: destination name to subscriber connections
//! (spec.md §4.4). Wildcards are not supported; matching is exact-string.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::message::Message;

/// Anything that can receive a delivered message. The broker's `Connection`
/// implements this; tests use a lightweight recording stub.
pub trait Subscriber: Send + Sync {
    /// Stable identity used for membership checks and removal. Two
    /// subscriber handles with the same id are the same connection.
    fn connection_id(&self) -> u64;

    /// Hand the message to this subscriber's send queue.
    fn enqueue(&self, message: Arc<Message>);
}

#[inline]
fn recover_write<T>(lock: &RwLock<T>, context: &str) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::debug!(context, "registry lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[inline]
fn recover_read<T>(lock: &RwLock<T>, context: &str) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::debug!(context, "registry lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Destination to subscriber-set mapping, guarded by a single reader-writer
/// lock so `deliver` calls never block each other (spec.md §5).
pub struct Registry {
    destinations: RwLock<HashMap<String, Vec<Arc<dyn Subscriber>>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            destinations: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent: re-subscribing an already-subscribed (destination,
    /// connection) pair is a no-op.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>, destinations: &[&str]) {
        let mut map = recover_write(&self.destinations, "Registry::destinations.write (subscribe)");
        for destination in destinations {
            let subscribers = map.entry((*destination).to_string()).or_default();
            let id = subscriber.connection_id();
            if !subscribers.iter().any(|s| s.connection_id() == id) {
                subscribers.push(subscriber.clone());
            }
        }
    }

    /// Absent pairs are no-ops.
    pub fn unsubscribe(&self, connection_id: u64, destination: &str) {
        let mut map = recover_write(&self.destinations, "Registry::destinations.write (unsubscribe)");
        if let Some(subscribers) = map.get_mut(destination) {
            subscribers.retain(|s| s.connection_id() != connection_id);
            if subscribers.is_empty() {
                map.remove(destination);
            }
        }
    }

    /// Remove every (destination, connection) pair for `connection_id`.
    /// After this returns, no in-flight `deliver` call will enqueue onto
    /// this connection for any destination (spec.md P4).
    pub fn clear_connection(&self, connection_id: u64) {
        let mut map = recover_write(&self.destinations, "Registry::destinations.write (clear_connection)");
        map.retain(|_, subscribers| {
            subscribers.retain(|s| s.connection_id() != connection_id);
            !subscribers.is_empty()
        });
    }

    /// Snapshot the subscriber set under the read lock, release it, then
    /// dispatch. A subscriber added or removed concurrently with this call
    /// may or may not see the message; one cleared just before the snapshot
    /// is taken never will.
    pub fn deliver(&self, destination: &str, message: Arc<Message>) -> usize {
        let snapshot: Vec<Arc<dyn Subscriber>> = {
            let map = recover_read(&self.destinations, "Registry::destinations.read (deliver)");
            match map.get(destination) {
                Some(subscribers) => subscribers.clone(),
                None => return 0,
            }
        };

        for subscriber in &snapshot {
            subscriber.enqueue(message.clone());
        }
        snapshot.len()
    }

    pub fn subscriber_count(&self, destination: &str) -> usize {
        let map = recover_read(&self.destinations, "Registry::destinations.read (subscriber_count)");
        map.get(destination).map(Vec::len).unwrap_or(0)
    }
}
