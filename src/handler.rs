//! Defines the core trait for message handling logic.

use crate::broker::Delivery;
use crate::error::WorkerError;
use async_trait::async_trait;
use std::future::Future;

/// A trait for processing messages delivered to the worker's destination.
///
/// The handler receives the raw delivery; decoding the body is up to the
/// implementation.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes a single delivered message.
    ///
    /// An `Err` is logged with the handler name and delivery tag. It never
    /// reaches the worker's error sink, and delivery continues.
    async fn handle_message(&self, delivery: Delivery) -> Result<(), WorkerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str {
        "message_handler"
    }
}

/// Adapts an async closure into a `MessageHandler`.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps `f` so it can be passed to `Worker::with_handler`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WorkerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WorkerError>> + Send,
{
    async fn handle_message(&self, delivery: Delivery) -> Result<(), WorkerError> {
        (self.f)(delivery).await
    }
}
