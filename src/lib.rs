// SPDX-License-Identifier: MIT

//! # smq — a small message-queue broker
//!
//! A pub/sub message broker with a pluggable wire protocol (a compact
//! native framing, or MQTT 3.1.1-style framing) and mmap-backed durable
//! storage.
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------------------------------------+
//! |                          smqd (binary)                            |
//! |   clap CLI | tracing init | config load | exit-code mapping       |
//! +-------------------------------------------------------------------+
//! |                            broker (lib)                            |
//! |   accept loop | per-connection state machine | worker pool        |
//! +-------------------------------------------------------------------+
//! |  codec (smq / mqtt) | registry (pub/sub) | storage (mmap buckets) |
//! +-------------------------------------------------------------------+
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`broker::Broker`] | Owns the registry, storage engine, and worker pool for one listener |
//! | [`broker::listener::Listener`] | Accept loop and per-connection reader threads |
//! | [`registry::Registry`] | Destination → subscriber-connection mapping |
//! | [`storage::Engine`] | Durable insert/lookup/free over mmap-backed buckets |
//! | [`codec::Codec`] | Wire protocol trait, implemented by [`codec::SmqCodec`] and [`codec::MqttCodec`] |
//! | [`client::Client`] | Minimal client-side control surface for talking to a listener |

pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod message;
pub mod registry;
pub mod storage;
pub mod transport;

pub use broker::{Broker, BrokerError};
pub use client::{Client, ClientError};
pub use config::ListenerConfig;
pub use message::{Message, MessageType};
