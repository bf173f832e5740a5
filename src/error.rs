//! Error types and the error-sink routing policy.

use std::sync::Arc;
use thiserror::Error;

/// Error reported by a broker client implementation.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Error originating from the underlying `lapin` library.
    #[error("AMQP error: {0}")]
    Lapin(#[from] lapin::Error),

    /// An option mapping could not be decoded into broker options.
    #[error("Invalid broker options: {0}")]
    InvalidOptions(#[from] serde_json::Error),

    /// Free-form error from a non-AMQP client.
    #[error("{0}")]
    Message(String),
}

impl From<&str> for BrokerError {
    fn from(s: &str) -> Self {
        BrokerError::Message(s.to_string())
    }
}

impl From<String> for BrokerError {
    fn from(s: String) -> Self {
        BrokerError::Message(s)
    }
}

/// Generic error type for the queue worker library.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Opening the broker connection failed.
    #[error("Failed to connect to broker: {0}")]
    Connection(#[source] BrokerError),

    /// Creating a channel on the held connection failed.
    #[error("Failed to create channel: {0}")]
    ChannelCreation(#[source] BrokerError),

    /// The connection reported a fault after it was established.
    #[error("Broker connection fault: {0}")]
    ConnectionFault(#[source] BrokerError),

    /// Publish, declare, consume, ack or close failed on an established channel.
    #[error("Broker operation failed: {0}")]
    Broker(#[from] BrokerError),

    /// No destination was configured, or it was empty.
    #[error("You must specify a destination before publishing or subscribing")]
    MissingDestination,

    /// A consumer is already attached to this worker.
    #[error("A listener for {destination} has already been attached")]
    DuplicateListener { destination: String },

    /// Subscribe was called without a message handler.
    #[error("You must provide a message handler before subscribing")]
    UnimplementedHandler,

    /// The serialization hook did not produce raw bytes.
    #[error("Message must serialize to raw bytes: {0}")]
    InvalidPayload(String),

    /// Acquisition failed and the error sink swallowed the failure.
    #[error("No broker channel is available")]
    NotConnected,

    /// The worker was marked defunct after a failed teardown.
    #[error("Worker is defunct after a failed teardown")]
    Defunct,

    /// Error from the message handler logic.
    #[error("Message handler failed: {0}")]
    HandlerError(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// Custom messaging-related error.
    #[error("Messaging error: {message}")]
    MessagingError { message: String },
}

impl WorkerError {
    /// Whether this error came from connection or channel acquisition, the only
    /// kinds eligible for the error sink.
    pub fn is_acquisition(&self) -> bool {
        matches!(
            self,
            WorkerError::Connection(_) | WorkerError::ChannelCreation(_) | WorkerError::ConnectionFault(_)
        )
    }
}

impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::MessagingError { message: s.to_string() }
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::MessagingError { message: s }
    }
}

/// Callback receiving errors that would otherwise fail the call or go unhandled.
pub type ErrorSink = Arc<dyn Fn(WorkerError) + Send + Sync>;

/// Routes connection and channel failures to the configured sink. Every other
/// error goes back to the caller.
#[derive(Clone, Default)]
pub(crate) struct ErrorPolicy {
    sink: Option<ErrorSink>,
}

impl ErrorPolicy {
    pub(crate) fn new(sink: Option<ErrorSink>) -> Self {
        Self { sink }
    }

    /// Hands an acquisition error to the sink, or returns `err` so the caller fails.
    pub(crate) fn route(&self, err: WorkerError) -> Result<(), WorkerError> {
        match &self.sink {
            Some(sink) if err.is_acquisition() => {
                sink(err);
                Ok(())
            }
            _ => Err(err),
        }
    }

    /// Reports a fault that has no pending call to fail. Without a sink the
    /// fault is logged and the worker carries on.
    pub(crate) fn report(&self, err: WorkerError) {
        if let Err(err) = self.route(err) {
            log::error!("Unhandled worker fault (no error sink configured): {}", err);
        }
    }
}
