//! The broker client capability consumed by the worker.
//!
//! A client opens connections, a connection opens channels, and a channel
//! declares, consumes from and publishes to destinations. `amqp` talks to a
//! real broker through `lapin`; `memory` keeps everything in-process.

pub mod amqp;
pub mod memory;

use crate::error::BrokerError;
use crate::options::Options;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// Listener for faults a connection reports after it is established.
pub type ErrorCallback = Box<dyn Fn(BrokerError) + Send + Sync>;

/// Invoked once per delivered message for the lifetime of a consumer.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// A message delivered to a consumer, passed to the handler as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The destination the message was consumed from.
    pub destination: String,
    /// Tag used to ack or nack this delivery on its channel.
    pub delivery_tag: u64,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    /// The raw message body.
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// Returned by a successful consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    tag: String,
}

impl ConsumerHandle {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    /// The consumer tag assigned by the broker.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self, target: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Registers a listener for asynchronous connection faults.
    fn on_error(&self, callback: ErrorCallback);

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares (asserts) the destination queue.
    async fn declare(&self, destination: &str, options: &Options) -> Result<(), BrokerError>;

    /// Attaches a consumer that invokes `callback` for every delivery.
    async fn consume(
        &self,
        destination: &str,
        callback: DeliveryCallback,
        options: &Options,
    ) -> Result<ConsumerHandle, BrokerError>;

    /// Sends `payload` to the destination. Returns once the publish has been
    /// issued, without waiting for a broker confirm.
    async fn publish(&self, destination: &str, payload: Vec<u8>, options: &Options) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Removes all ready messages from the destination, returning how many were dropped.
    async fn purge(&self, destination: &str) -> Result<u32, BrokerError>;

    /// Deletes the destination, returning how many messages it held.
    async fn delete(&self, destination: &str) -> Result<u32, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
