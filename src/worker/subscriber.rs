//! Attaching the worker's handler as the destination's consumer, plus
//! passthroughs for acking and managing the destination.

use super::Worker;
use crate::broker::{ConsumerHandle, Delivery, DeliveryCallback};
use crate::error::WorkerError;
use crate::handler::MessageHandler;
use crate::options::{merge, Options};
use futures_util::FutureExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl Worker {
    /// Declares the destination and attaches the handler with the default options.
    pub async fn subscribe(&self) -> Result<ConsumerHandle, WorkerError> {
        self.subscribe_with(Options::new(), Options::new()).await
    }

    /// Declares the destination and attaches the worker's handler as its consumer.
    ///
    /// A worker has at most one consumer: a second call fails with
    /// `DuplicateListener` until a successful teardown.
    pub async fn subscribe_with(
        &self,
        declare_options: Options,
        consume_options: Options,
    ) -> Result<ConsumerHandle, WorkerError> {
        let _gate = self.subscribe_gate.lock().await;
        if self.listening.load(Ordering::Acquire) {
            return Err(WorkerError::DuplicateListener {
                destination: self.config.destination.clone(),
            });
        }
        let destination = self.resolve_destination(None)?;
        let handler = self.handler.clone().ok_or(WorkerError::UnimplementedHandler)?;

        let declare_options = merge(&self.config.declare_options, &declare_options);
        let consume_options = merge(&self.config.consume_options, &consume_options);

        let channel = self.require_channel().await?;
        channel.declare(&destination, &declare_options).await?;
        let consumer = channel
            .consume(&destination, delivery_callback(handler), &consume_options)
            .await?;

        self.listening.store(true, Ordering::Release);
        *self.consumer_tag.lock().await = Some(consumer.tag().to_string());
        // A handler may already have torn the worker down from a queued delivery.
        let still_open = self
            .channel()
            .await
            .is_some_and(|held| Arc::ptr_eq(&held, &channel));
        if !still_open {
            log::debug!("Channel for '{}' closed while the consumer was starting", destination);
            self.reset_listener().await;
            return Ok(consumer);
        }
        log::info!(
            "Consumer started with tag '{}' on '{}'. Waiting for messages...",
            consumer.tag(),
            destination
        );
        Ok(consumer)
    }

    /// Acknowledges `delivery` on the held channel.
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), WorkerError> {
        let channel = self.channel().await.ok_or(WorkerError::NotConnected)?;
        channel.ack(delivery.delivery_tag).await?;
        Ok(())
    }

    /// Rejects `delivery` on the held channel, optionally requeueing it.
    pub async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), WorkerError> {
        let channel = self.channel().await.ok_or(WorkerError::NotConnected)?;
        channel.nack(delivery.delivery_tag, requeue).await?;
        Ok(())
    }

    /// Drops every ready message on the destination.
    pub async fn purge_destination(&self) -> Result<u32, WorkerError> {
        let destination = self.resolve_destination(None)?;
        let purged = self.require_channel().await?.purge(&destination).await?;
        log::info!("Purged {} messages from '{}'", purged, destination);
        Ok(purged)
    }

    /// Deletes the destination from the broker.
    pub async fn delete_destination(&self) -> Result<u32, WorkerError> {
        let destination = self.resolve_destination(None)?;
        let dropped = self.require_channel().await?.delete(&destination).await?;
        log::info!("Deleted '{}' ({} messages dropped)", destination, dropped);
        Ok(dropped)
    }
}

fn delivery_callback(handler: Arc<dyn MessageHandler>) -> DeliveryCallback {
    Arc::new(move |delivery: Delivery| {
        let handler = handler.clone();
        async move {
            let delivery_tag = delivery.delivery_tag;
            if let Err(e) = handler.handle_message(delivery).await {
                log::error!(
                    "Handler '{}' failed to process message. Tag: {}, Error: {}",
                    handler.handler_name(),
                    delivery_tag,
                    e
                );
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{config, recording_sink, worker};
    use super::*;
    use crate::broker::memory::{Call, MemoryBroker, Operation};
    use crate::handler::handler_fn;
    use crate::options::from_json;
    use serde_json::{json, Value};
    use std::sync::{OnceLock, Weak};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn noop() -> impl MessageHandler {
        handler_fn(|_delivery: Delivery| async { Ok::<(), WorkerError>(()) })
    }

    fn forwarding() -> (impl MessageHandler, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(delivery);
                Ok::<(), WorkerError>(())
            }
        });
        (handler, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("handler dropped")
    }

    #[tokio::test]
    async fn test_subscribe_declares_and_consumes() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "test-queue").with_handler(noop());

        let consumer = worker.subscribe().await.unwrap();

        assert!(worker.is_listening());
        assert_eq!(worker.consumer_tag().await.as_deref(), Some(consumer.tag()));
        assert_eq!(broker.count(Operation::Declare), 1);
        assert_eq!(broker.count(Operation::Consume), 1);
    }

    #[tokio::test]
    async fn test_second_subscribe_is_rejected() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "test-queue").with_handler(noop());
        worker.subscribe().await.unwrap();

        let err = worker.subscribe().await.unwrap_err();

        assert_eq!(err.to_string(), "A listener for test-queue has already been attached");
        assert_eq!(broker.count(Operation::Declare), 1);
        assert_eq!(broker.count(Operation::Consume), 1);
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_attach_once() {
        let broker = MemoryBroker::new();
        broker.delay(Operation::Connect, Duration::from_millis(20));
        let worker = worker(&broker, "test-queue").with_handler(noop());

        let (a, b) = tokio::join!(worker.subscribe(), worker.subscribe());

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(broker.count(Operation::Consume), 1);
    }

    #[tokio::test]
    async fn test_subscribe_without_destination() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "").with_handler(noop());

        assert!(matches!(worker.subscribe().await, Err(WorkerError::MissingDestination)));
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_without_handler_makes_no_calls() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "test-queue");

        assert!(matches!(worker.subscribe().await, Err(WorkerError::UnimplementedHandler)));
        assert!(!worker.is_listening());
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_declare_and_consume_options_merge() {
        let broker = MemoryBroker::new();
        let mut config = config("test-queue");
        config.declare_options = from_json(json!({ "durable": true }));
        config.consume_options = from_json(json!({ "exclusive": true }));
        let worker = Worker::new(broker.clone(), config).with_handler(noop());

        worker
            .subscribe_with(from_json(json!({ "auto_delete": true })), from_json(json!({ "exclusive": false })))
            .await
            .unwrap();

        let calls = broker.calls();
        let declared = calls.iter().find_map(|c| match c {
            Call::Declare { options, .. } => Some(Value::Object(options.clone())),
            _ => None,
        });
        let consumed = calls.iter().find_map(|c| match c {
            Call::Consume { options, .. } => Some(Value::Object(options.clone())),
            _ => None,
        });
        assert_eq!(declared, Some(json!({ "durable": true, "auto_delete": true })));
        assert_eq!(consumed, Some(json!({ "exclusive": false })));
    }

    #[tokio::test]
    async fn test_published_message_reaches_handler() {
        let broker = MemoryBroker::new();
        let (handler, mut rx) = forwarding();
        let worker = worker(&broker, "orders").with_handler(handler);

        worker.subscribe().await.unwrap();
        worker.publish(b"hello".to_vec()).await.unwrap();

        let delivery = next(&mut rx).await;
        assert_eq!(String::from_utf8(delivery.body).unwrap(), "hello");
        assert_eq!(delivery.destination, "orders");
    }

    #[tokio::test]
    async fn test_ack_and_nack_pass_through() {
        let broker = MemoryBroker::new();
        let (handler, mut rx) = forwarding();
        let worker = worker(&broker, "orders").with_handler(handler);
        worker.subscribe().await.unwrap();
        worker.publish(b"a".to_vec()).await.unwrap();
        worker.publish(b"b".to_vec()).await.unwrap();

        let first = next(&mut rx).await;
        let second = next(&mut rx).await;
        worker.ack(&first).await.unwrap();
        worker.nack(&second, true).await.unwrap();

        let calls = broker.calls();
        assert!(calls.contains(&Call::Ack { delivery_tag: first.delivery_tag }));
        assert!(calls.contains(&Call::Nack { delivery_tag: second.delivery_tag, requeue: true }));
    }

    #[tokio::test]
    async fn test_ack_without_channel_fails() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "orders");
        let delivery = Delivery {
            destination: "orders".to_string(),
            delivery_tag: 1,
            redelivered: false,
            body: Vec::new(),
            content_type: None,
        };

        assert!(matches!(worker.ack(&delivery).await, Err(WorkerError::NotConnected)));
    }

    #[tokio::test]
    async fn test_handler_error_is_logged_not_sunk() {
        let broker = MemoryBroker::new();
        let (sink, seen) = recording_sink();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(delivery.clone());
                Err::<(), WorkerError>(WorkerError::from("cannot process"))
            }
        });
        let worker = worker(&broker, "orders").with_handler(handler).with_error_sink(sink);
        worker.subscribe().await.unwrap();
        worker.publish(b"x".to_vec()).await.unwrap();
        worker.publish(b"y".to_vec()).await.unwrap();

        next(&mut rx).await;
        next(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(seen.lock().unwrap().is_empty());
        assert!(worker.is_listening());
    }

    type WorkerSlot = Arc<OnceLock<Weak<Worker>>>;

    async fn ack_purge_and_stop(slot: &WorkerSlot, delivery: Delivery) -> Result<String, WorkerError> {
        let worker = slot
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| WorkerError::from("worker is gone"))?;
        worker.ack(&delivery).await?;
        worker.purge_destination().await?;
        worker.teardown().await?;
        Ok(String::from_utf8_lossy(&delivery.body).into_owned())
    }

    fn self_stopping(slot: WorkerSlot) -> (impl MessageHandler, mpsc::UnboundedReceiver<Result<String, String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |delivery: Delivery| {
            let slot = slot.clone();
            let tx = tx.clone();
            async move {
                let outcome = ack_purge_and_stop(&slot, delivery).await;
                let _ = tx.send(outcome.map_err(|e| e.to_string()));
                Ok::<(), WorkerError>(())
            }
        });
        (handler, rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handler_can_ack_purge_and_tear_down() {
        let broker = MemoryBroker::new();
        let slot: WorkerSlot = Arc::new(OnceLock::new());
        let (handler, mut rx) = self_stopping(slot.clone());
        let worker = Arc::new(worker(&broker, "orders").with_handler(handler));
        slot.set(Arc::downgrade(&worker)).unwrap();

        worker.subscribe().await.unwrap();
        worker.publish(b"hello world".to_vec()).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(outcome, Some(Ok("hello world".to_string())));
        assert!(broker.calls().contains(&Call::Ack { delivery_tag: 1 }));
        assert_eq!(broker.count(Operation::Purge), 1);
        assert_eq!(broker.count(Operation::CloseChannel), 1);
        assert_eq!(broker.count(Operation::CloseConnection), 1);
        assert!(!worker.is_listening());
        assert!(worker.channel().await.is_none());
    }

    #[tokio::test]
    async fn test_teardown_while_consumer_starts_leaves_worker_idle() {
        let broker = MemoryBroker::new();
        broker.delay(Operation::Consume, Duration::from_millis(50));
        let slot: WorkerSlot = Arc::new(OnceLock::new());
        let (handler, mut rx) = self_stopping(slot.clone());
        let worker = Arc::new(worker(&broker, "orders").with_handler(handler));
        slot.set(Arc::downgrade(&worker)).unwrap();
        worker.publish(b"queued".to_vec()).await.unwrap();

        worker.subscribe().await.unwrap();

        assert_eq!(rx.recv().await, Some(Ok("queued".to_string())));
        assert!(!worker.is_listening());
        assert!(worker.consumer_tag().await.is_none());
        worker.subscribe().await.unwrap();
        assert_eq!(broker.count(Operation::Consume), 2);
    }

    #[tokio::test]
    async fn test_purge_and_delete_destination() {
        let broker = MemoryBroker::new();
        let worker = worker(&broker, "orders");
        worker.publish(b"a".to_vec()).await.unwrap();
        worker.publish(b"b".to_vec()).await.unwrap();

        assert_eq!(worker.purge_destination().await.unwrap(), 2);
        worker.publish(b"c".to_vec()).await.unwrap();
        assert_eq!(worker.delete_destination().await.unwrap(), 1);
        assert_eq!(broker.ready("orders"), 0);
    }
}
