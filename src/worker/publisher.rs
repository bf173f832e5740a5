//! Publishing serialized messages to the worker's destination.

use super::Worker;
use crate::broker::BrokerChannel;
use crate::error::WorkerError;
use crate::message::Message;
use crate::options::{merge, Options};
use std::sync::Arc;

/// Per-call overrides for `Worker::publish_with`.
#[derive(Clone, Default)]
pub struct PublishOverrides {
    /// Publish here instead of the worker's destination.
    pub destination: Option<String>,
    /// Publish on this channel instead of the worker's own.
    pub channel: Option<Arc<dyn BrokerChannel>>,
    /// Merged over the worker's default publish options.
    pub options: Options,
}

impl PublishOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn channel(mut self, channel: Arc<dyn BrokerChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }
}

impl Worker {
    /// Publishes `message` to the worker's destination with the default options.
    pub async fn publish(&self, message: impl Into<Message>) -> Result<(), WorkerError> {
        self.publish_with(message, PublishOverrides::default()).await
    }

    /// Serializes `message` and publishes it.
    ///
    /// The destination and payload are validated before any broker call. The
    /// returned future resolves once the publish is issued; broker confirms are
    /// not awaited and failures are not retried.
    pub async fn publish_with(
        &self,
        message: impl Into<Message>,
        overrides: PublishOverrides,
    ) -> Result<(), WorkerError> {
        let destination = self.resolve_destination(overrides.destination.as_deref())?;
        let payload = self.serializer.serialize(message.into())?;
        let options = merge(&self.config.publish_options, &overrides.options);

        let channel = match overrides.channel {
            Some(channel) => channel,
            None => self.require_channel().await?,
        };

        let size = payload.len();
        channel.publish(&destination, payload, &options).await?;
        log::debug!("Published {} bytes to '{}'", size, destination);
        Ok(())
    }
}
