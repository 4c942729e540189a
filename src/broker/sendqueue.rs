// SPDX-License-Identifier: MIT

//! Per-connection outbound FIFO with a "processing" flag, so at most one
//! worker drains a given queue at a time (spec.md §4.5).
//!
//! Transcribed from the original send queue's push/run/getMessage shape: a
//! push that observes `processing == false` flips it and submits a drain
//! task; the drain loop pops messages until empty, then clears the flag. A
//! push racing the clear leaves the dispatch to the worker already running,
//! which re-checks after clearing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::message::Message;

struct Inner {
    messages: VecDeque<Arc<Message>>,
    processing: bool,
}

/// A connection's outbound queue. Cloning shares the same underlying queue
/// (cheap `Arc` handle) so the registry and the worker pool can each hold
/// one.
#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<Mutex<Inner>>,
    high_water: usize,
    dropped: Arc<AtomicU64>,
}

impl SendQueue {
    pub fn new(high_water: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                messages: VecDeque::new(),
                processing: false,
            })),
            high_water,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total messages dropped for this queue due to back-pressure.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Push a message. If the queue is above `high_water`, the oldest
    /// message is dropped first (spec.md P6). Returns `true` if the caller
    /// must submit a drain task for this queue (the queue transitioned from
    /// idle to processing).
    pub fn push(&self, message: Arc<Message>) -> bool {
        let mut inner = self.inner.lock();
        inner.messages.push_back(message);
        while inner.messages.len() > self.high_water {
            inner.messages.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        if !inner.processing {
            inner.processing = true;
            true
        } else {
            false
        }
    }

    /// Pop the next message, if any. When the queue is left empty, clears
    /// `processing` and returns `None` so the worker's drain loop can stop.
    pub fn pop(&self) -> Option<Arc<Message>> {
        let mut inner = self.inner.lock();
        let message = inner.messages.pop_front();
        inner.processing = !inner.messages.is_empty();
        message
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn msg(payload: &str) -> Arc<Message> {
        Arc::new(Message::new(MessageType::Message, "q/1", payload.as_bytes().to_vec()))
    }

    #[test]
    fn first_push_requests_dispatch_subsequent_do_not() {
        let queue = SendQueue::new(10);
        assert!(queue.push(msg("a")));
        assert!(!queue.push(msg("b")));
    }

    #[test]
    fn pop_drains_in_fifo_order_and_clears_processing() {
        let queue = SendQueue::new(10);
        queue.push(msg("a"));
        queue.push(msg("b"));

        assert_eq!(queue.pop().unwrap().payload(), b"a");
        assert_eq!(queue.pop().unwrap().payload(), b"b");
        assert!(queue.pop().is_none());

        // A push after drain must request dispatch again.
        assert!(queue.push(msg("c")));
    }

    #[test]
    fn back_pressure_drops_oldest_and_counts() {
        let queue = SendQueue::new(2);
        queue.push(msg("a"));
        queue.push(msg("b"));
        queue.push(msg("c")); // drops "a"

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.pop().unwrap().payload(), b"b");
        assert_eq!(queue.pop().unwrap().payload(), b"c");
    }
}
