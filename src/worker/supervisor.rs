//! Lazy, single-flight acquisition of the connection and channel.
//!
//! Failed acquisitions and later connection faults go to the error sink when
//! one is set.

use super::Worker;
use crate::broker::{BrokerChannel, BrokerConnection};
use crate::error::{BrokerError, WorkerError};
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl Worker {
    /// Returns the held connection, opening one if none is held.
    ///
    /// A failed connect is routed to the error sink; with a sink configured the
    /// result is `Ok(None)` and no connection is stored. Without one, the
    /// failure is returned.
    pub async fn acquire_connection(&self) -> Result<Option<Arc<dyn BrokerConnection>>, WorkerError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(Some(connection.clone()));
        }
        self.ensure_usable()?;

        log::info!("Connecting to broker at {}...", self.config.redacted_target());
        match self.client.connect(&self.config.connection_target).await {
            Ok(connection) => {
                let errors = self.errors.clone();
                connection.on_error(Box::new(move |err: BrokerError| errors.report(WorkerError::ConnectionFault(err))));
                *slot = Some(connection.clone());
                log::info!("Connected to broker at {}", self.config.redacted_target());
                Ok(Some(connection))
            }
            Err(err) => {
                log::warn!("Connection to {} failed: {}", self.config.redacted_target(), err);
                self.errors.route(WorkerError::Connection(err))?;
                Ok(None)
            }
        }
    }

    /// Returns the held channel, opening the connection and a channel on it as
    /// needed. Failures follow the same sink routing as `acquire_connection`.
    pub async fn acquire_channel(&self) -> Result<Option<Arc<dyn BrokerChannel>>, WorkerError> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            return Ok(Some(channel.clone()));
        }

        let Some(connection) = self.acquire_connection().await? else {
            return Ok(None);
        };

        match connection.create_channel().await {
            Ok(channel) => {
                *slot = Some(channel.clone());
                log::debug!("Channel opened for destination '{}'", self.config.destination);
                Ok(Some(channel))
            }
            Err(err) => {
                log::warn!("Channel creation failed: {}", err);
                self.errors.route(WorkerError::ChannelCreation(err))?;
                Ok(None)
            }
        }
    }

    /// Like `acquire_channel`, but a swallowed failure becomes `NotConnected`.
    pub(crate) async fn require_channel(&self) -> Result<Arc<dyn BrokerChannel>, WorkerError> {
        self.acquire_channel().await?.ok_or(WorkerError::NotConnected)
    }

    fn ensure_usable(&self) -> Result<(), WorkerError> {
        if self.defunct.load(Ordering::Acquire) {
            return Err(WorkerError::Defunct);
        }
        Ok(())
    }
}
