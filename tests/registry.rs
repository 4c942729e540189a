// SPDX-License-Identifier: MIT

//! P4 (subscription exclusivity) and P5 (per-publisher FIFO), exercised with
//! real threads rather than sequential calls so the reader/writer lock
//! discipline is actually contended.

use std::sync::{Arc, Barrier};

use parking_lot::Mutex;
use smq::message::{Message, MessageType};
use smq::registry::{Registry, Subscriber};

struct Collector {
    id: u64,
    received: Mutex<Vec<Arc<Message>>>,
}

impl Collector {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            received: Mutex::new(Vec::new()),
        })
    }
}

impl Subscriber for Collector {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn enqueue(&self, message: Arc<Message>) {
        self.received.lock().push(message);
    }
}

#[test]
fn clear_connection_is_visible_to_concurrent_delivers() {
    let registry = Arc::new(Registry::new());
    let subscriber = Collector::new(1);
    registry.subscribe(subscriber.clone(), &["q/race"]);

    let barrier = Arc::new(Barrier::new(2));

    let deliverer = {
        let registry = registry.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            barrier.wait();
            for i in 0..2000u32 {
                let message = Arc::new(Message::new(MessageType::Message, "q/race", i.to_le_bytes().to_vec()));
                registry.deliver("q/race", message);
            }
        })
    };

    let clearer = {
        let registry = registry.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            barrier.wait();
            registry.clear_connection(1);
        })
    };

    deliverer.join().unwrap();
    clearer.join().unwrap();

    // No assertion on *how many* messages arrived before the clear landed —
    // that's a race by design (spec.md P4 only promises none arrive *after*
    // clear_connection returns, which this test can't observe mid-flight).
    // What matters is that clear_connection leaves the registry consistent:
    // a fresh deliver afterward reaches nobody.
    registry.deliver("q/race", Arc::new(Message::new(MessageType::Message, "q/race", b"late".to_vec())));
    assert_eq!(registry.subscriber_count("q/race"), 0);
}

#[test]
fn concurrent_publishers_each_preserve_their_own_fifo_order() {
    let registry = Arc::new(Registry::new());
    let subscriber = Collector::new(1);
    registry.subscribe(subscriber.clone(), &["q/multi"]);

    let publishers: Vec<_> = (0..4u8)
        .map(|publisher_id| {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for seq in 0..50u32 {
                    let payload = [publisher_id].iter().chain(seq.to_le_bytes().iter()).copied().collect::<Vec<u8>>();
                    registry.deliver("q/multi", Arc::new(Message::new(MessageType::Message, "q/multi", payload)));
                }
            })
        })
        .collect();
    for p in publishers {
        p.join().unwrap();
    }

    let received = subscriber.received.lock();
    assert_eq!(received.len(), 200);

    let mut last_seq_per_publisher = [None; 4];
    for message in received.iter() {
        let payload = message.payload();
        let publisher_id = payload[0] as usize;
        let seq = u32::from_le_bytes(payload[1..5].try_into().unwrap());
        if let Some(last) = last_seq_per_publisher[publisher_id] {
            assert!(seq > last, "publisher {publisher_id} delivered out of order: {last} then {seq}");
        }
        last_seq_per_publisher[publisher_id] = Some(seq);
    }
}

#[test]
fn unsubscribe_removes_only_the_named_destination() {
    let registry = Registry::new();
    let subscriber = Collector::new(1);
    registry.subscribe(subscriber.clone(), &["q/a", "q/b"]);

    registry.unsubscribe(1, "q/a");

    assert_eq!(registry.subscriber_count("q/a"), 0);
    assert_eq!(registry.subscriber_count("q/b"), 1);
}
