//! # Queue Worker
//! A base worker for publishing to and consuming from a single broker queue.
//!
//! The worker opens its connection and channel lazily and reuses them,
//! attaches at most one consumer, routes acquisition failures to an optional
//! error sink, and tears everything down in order.

pub mod broker;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod options;
pub mod worker;

// Re-export key components for easy access
pub use broker::amqp::AmqpClient;
pub use broker::memory::MemoryBroker;
pub use broker::{BrokerChannel, BrokerClient, BrokerConnection, ConsumerHandle, Delivery};
pub use config::{ConnectionSettings, TeardownPolicy, WorkerConfig};
pub use error::{BrokerError, WorkerError};
pub use handler::{handler_fn, MessageHandler};
pub use message::{Message, MessageSerializer};
pub use options::Options;
pub use worker::{PublishOverrides, Worker};
