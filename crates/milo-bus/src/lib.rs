//! Topic-based pub/sub message bus over ZeroMQ.
//!
//! Two roles interoperate over TCP: a [`PublisherBus`] fans messages from any
//! number of producer threads into a single egress PUB socket, and a
//! [`SubscriberBus`] filters by topic prefix and hands each message to a
//! fixed worker pool while a [`Metrics`] collector tracks end-to-end latency
//! and throughput.
//!
//! ZeroMQ sockets are single-owner: every socket here lives on exactly one
//! thread for its entire lifetime (the I/O thread, or the producing thread
//! for PUSH handles).
use std::sync::Arc;

pub mod config;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod publisher;
pub mod stamp;
pub mod subscriber;

pub use config::BusConfig;
pub use message::Message;
pub use metrics::{Metrics, Stats, format_duration};
pub use pool::WorkerPool;
pub use publisher::PublisherBus;
pub use subscriber::SubscriberBus;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),
    #[error("spawn i/o thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

/// Callback invoked by the subscriber's worker pool for every message.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
