//! Ordered teardown of the channel and connection.

use super::Worker;
use crate::config::TeardownPolicy;
use crate::error::{BrokerError, WorkerError};
use std::sync::atomic::Ordering;

impl Worker {
    /// Runs the pre-teardown hook, closes the channel, then the connection.
    ///
    /// Handles that were never opened are skipped. On success both handles are
    /// cleared and the worker may subscribe again. On a failed close the
    /// configured `TeardownPolicy` decides what happens to the handles, and the
    /// first failure is returned.
    pub async fn teardown(&self) -> Result<(), WorkerError> {
        if let Some(hook) = &self.before_teardown {
            hook().await?;
        }

        let mut channel = self.channel.lock().await;
        let mut connection = self.connection.lock().await;
        let policy = self.config.teardown_policy;

        let mut result: Result<(), BrokerError> = Ok(());
        if let Some(open) = channel.as_ref() {
            result = open.close().await;
        }
        if result.is_ok() || policy != TeardownPolicy::KeepOnFailure {
            if let Some(open) = connection.as_ref() {
                let closed = open.close().await;
                result = result.and(closed);
            }
        }

        let Err(e) = result else {
            log::info!("Disconnected from {}", self.config.redacted_target());
            *channel = None;
            *connection = None;
            self.reset_listener().await;
            return Ok(());
        };

        match policy {
            TeardownPolicy::KeepOnFailure => {
                log::warn!("Teardown failed, keeping handles for a retry: {}", e);
            }
            TeardownPolicy::ClearAlways => {
                log::warn!("Teardown failed, dropping handles anyway: {}", e);
                *channel = None;
                *connection = None;
                self.reset_listener().await;
            }
            TeardownPolicy::Defunct => {
                log::error!("Teardown failed, worker is now defunct: {}", e);
                self.defunct.store(true, Ordering::Release);
                *channel = None;
                *connection = None;
            }
        }
        Err(WorkerError::from(e))
    }

    pub(super) async fn reset_listener(&self) {
        self.listening.store(false, Ordering::Release);
        *self.consumer_tag.lock().await = None;
    }
}
