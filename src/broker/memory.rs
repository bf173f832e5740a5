//! In-process broker client for tests and local development.
//!
//! Every call is recorded so callers can assert on exactly what reached the
//! broker. The log keeps published payloads and grows until `clear_calls`. Published messages are delivered to the consumer attached to the
//! destination, or held until one attaches. Failures can be injected per
//! operation.

use super::{BrokerChannel, BrokerClient, BrokerConnection, ConsumerHandle, Delivery, DeliveryCallback, ErrorCallback};
use crate::error::BrokerError;
use crate::options::Options;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Broker operations that can be counted or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    CreateChannel,
    Declare,
    Consume,
    Publish,
    Ack,
    Nack,
    Purge,
    Delete,
    CloseChannel,
    CloseConnection,
}

/// A call that reached the broker, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect { target: String },
    CreateChannel,
    Declare { destination: String, options: Options },
    Consume { destination: String, options: Options },
    Publish { destination: String, payload: Vec<u8>, options: Options },
    Ack { delivery_tag: u64 },
    Nack { delivery_tag: u64, requeue: bool },
    Purge { destination: String },
    Delete { destination: String },
    CloseChannel,
    CloseConnection,
}

impl Call {
    pub fn operation(&self) -> Operation {
        match self {
            Call::Connect { .. } => Operation::Connect,
            Call::CreateChannel => Operation::CreateChannel,
            Call::Declare { .. } => Operation::Declare,
            Call::Consume { .. } => Operation::Consume,
            Call::Publish { .. } => Operation::Publish,
            Call::Ack { .. } => Operation::Ack,
            Call::Nack { .. } => Operation::Nack,
            Call::Purge { .. } => Operation::Purge,
            Call::Delete { .. } => Operation::Delete,
            Call::CloseChannel => Operation::CloseChannel,
            Call::CloseConnection => Operation::CloseConnection,
        }
    }
}

struct Consumer {
    channel_id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    failures: HashMap<Operation, VecDeque<String>>,
    delays: HashMap<Operation, Duration>,
    queues: HashMap<String, VecDeque<Delivery>>,
    consumers: HashMap<String, Consumer>,
    listeners: Vec<(u64, Arc<dyn Fn(BrokerError) + Send + Sync>)>,
    channel_owners: HashMap<u64, u64>,
    next_id: u64,
    next_tag: u64,
}

impl State {
    fn record(&mut self, call: Call) -> Result<(), BrokerError> {
        let operation = call.operation();
        self.calls.push(call);
        match self.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(message) => Err(BrokerError::Message(message)),
            None => Ok(()),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn drop_channel(&mut self, channel_id: u64) {
        self.consumers.retain(|_, consumer| consumer.channel_id != channel_id);
        self.channel_owners.remove(&channel_id);
    }
}

/// An in-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next call of `operation` fail with `message`. Repeated calls queue
    /// further failures.
    pub fn fail_next(&self, operation: Operation, message: impl Into<String>) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(message.into());
    }

    /// Delays every future call of `operation` by `delay` before it completes.
    pub fn delay(&self, operation: Operation, delay: Duration) {
        self.state().delays.insert(operation, delay);
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Empties the call log.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// How many calls of `operation` were received, including failed ones.
    pub fn count(&self, operation: Operation) -> usize {
        self.state().calls.iter().filter(|c| c.operation() == operation).count()
    }

    /// Messages waiting on `destination` with no consumer to take them.
    pub fn ready(&self, destination: &str) -> usize {
        self.state().queues.get(destination).map_or(0, VecDeque::len)
    }

    /// Fires the error listeners of every open connection, as a broker would on
    /// an unexpected connection failure.
    pub fn emit_connection_error(&self, message: &str) {
        let listeners: Vec<_> = self.state().listeners.iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(BrokerError::from(message));
        }
    }

    async fn pause(&self, operation: Operation) {
        let delay = self.state().delays.get(&operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(&self, target: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let result = self.state().record(Call::Connect { target: target.to_string() });
        self.pause(Operation::Connect).await;
        result?;

        let id = self.state().next_id();
        Ok(Arc::new(MemoryConnection { id, broker: self.clone(), closed: AtomicBool::new(false) }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::from("connection is closed"));
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.broker.state().listeners.retain(|(conn, _)| *conn != self.id);
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn on_error(&self, callback: ErrorCallback) {
        self.broker.state().listeners.push((self.id, Arc::from(callback)));
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let result = self.broker.state().record(Call::CreateChannel);
        self.broker.pause(Operation::CreateChannel).await;
        result?;
        self.ensure_open()?;

        let mut state = self.broker.state();
        let id = state.next_id();
        state.channel_owners.insert(id, self.id);
        Ok(Arc::new(MemoryChannel { id, broker: self.broker.clone(), closed: AtomicBool::new(false) }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.record(Call::CloseConnection)?;
        self.closed.store(true, Ordering::Release);

        let owned: Vec<u64> = state
            .channel_owners
            .iter()
            .filter(|(_, conn)| **conn == self.id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in owned {
            state.drop_channel(channel);
        }
        state.listeners.retain(|(conn, _)| *conn != self.id);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryChannel {
    /// Records `call`, then fails if it was scheduled to or the channel is closed.
    fn begin(&self, call: Call) -> Result<MutexGuard<'_, State>, BrokerError> {
        let mut state = self.broker.state();
        state.record(call)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::from("channel is closed"));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare(&self, destination: &str, options: &Options) -> Result<(), BrokerError> {
        let mut state = self.begin(Call::Declare {
            destination: destination.to_string(),
            options: options.clone(),
        })?;
        state.queues.entry(destination.to_string()).or_default();
        Ok(())
    }

    async fn consume(
        &self,
        destination: &str,
        callback: DeliveryCallback,
        options: &Options,
    ) -> Result<ConsumerHandle, BrokerError> {
        let (tag, mut receiver) = {
            let mut state = self.begin(Call::Consume {
                destination: destination.to_string(),
                options: options.clone(),
            })?;
            let tag = match options.get("consumer_tag").and_then(Value::as_str) {
                Some(tag) if !tag.is_empty() => tag.to_string(),
                _ => format!("memory-ctag-{}", state.next_id()),
            };

            let (sender, receiver) = mpsc::unbounded_channel();
            for delivery in state.queues.entry(destination.to_string()).or_default().drain(..) {
                let _ = sender.send(delivery);
            }
            state.consumers.insert(destination.to_string(), Consumer { channel_id: self.id, sender });
            (tag, receiver)
        };

        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                callback(delivery).await;
            }
        });
        // Held deliveries may be handled before the caller sees the handle.
        self.broker.pause(Operation::Consume).await;

        Ok(ConsumerHandle::new(tag))
    }

    async fn publish(&self, destination: &str, payload: Vec<u8>, options: &Options) -> Result<(), BrokerError> {
        let mut state = self.begin(Call::Publish {
            destination: destination.to_string(),
            payload: payload.clone(),
            options: options.clone(),
        })?;
        state.next_tag += 1;
        let delivery = Delivery {
            destination: destination.to_string(),
            delivery_tag: state.next_tag,
            redelivered: false,
            body: payload,
            content_type: options.get("content_type").and_then(Value::as_str).map(str::to_string),
        };

        let undelivered = match state.consumers.get(destination) {
            Some(consumer) => consumer.sender.send(delivery).err().map(|e| e.0),
            None => Some(delivery),
        };
        if let Some(delivery) = undelivered {
            state.queues.entry(destination.to_string()).or_default().push_back(delivery);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        drop(self.begin(Call::Ack { delivery_tag })?);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        drop(self.begin(Call::Nack { delivery_tag, requeue })?);
        Ok(())
    }

    async fn purge(&self, destination: &str) -> Result<u32, BrokerError> {
        let mut state = self.begin(Call::Purge { destination: destination.to_string() })?;
        let purged = state.queues.get_mut(destination).map_or(0, |q| q.drain(..).count());
        Ok(purged as u32)
    }

    async fn delete(&self, destination: &str) -> Result<u32, BrokerError> {
        let mut state = self.begin(Call::Delete { destination: destination.to_string() })?;
        state.consumers.remove(destination);
        Ok(state.queues.remove(destination).map_or(0, |q| q.len() as u32))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.record(Call::CloseChannel)?;
        self.closed.store(true, Ordering::Release);
        state.drop_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn recorder() -> (DeliveryCallback, UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: DeliveryCallback = Arc::new(move |delivery| {
            let _ = tx.send(delivery);
            async {}.boxed()
        });
        (callback, rx)
    }

    async fn open_channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect("amqp://localhost:5672/").await.unwrap();
        connection.create_channel().await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_before_consume_is_held_then_delivered() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;

        channel.publish("jobs", b"first".to_vec(), &Options::new()).await.unwrap();
        assert_eq!(broker.ready("jobs"), 1);

        let (callback, mut rx) = recorder();
        channel.consume("jobs", callback, &Options::new()).await.unwrap();
        channel.publish("jobs", b"second".to_vec(), &Options::new()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().body, b"first");
        assert_eq!(rx.recv().await.unwrap().body, b"second");
        assert_eq!(broker.ready("jobs"), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_is_recorded_and_consumed_once() {
        let broker = MemoryBroker::new();
        broker.fail_next(Operation::Connect, "boom");

        let err = broker.connect("amqp://x/").await.err().unwrap();
        assert_eq!(err.to_string(), "boom");
        assert!(broker.connect("amqp://x/").await.is_ok());
        assert_eq!(broker.count(Operation::Connect), 2);
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_publish() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.close().await.unwrap();

        assert!(channel.publish("jobs", vec![1], &Options::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_explicit_consumer_tag_and_purge() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.publish("jobs", vec![1], &Options::new()).await.unwrap();
        channel.publish("jobs", vec![2], &Options::new()).await.unwrap();

        assert_eq!(channel.purge("jobs").await.unwrap(), 2);

        let mut options = Options::new();
        options.insert("consumer_tag".to_string(), Value::from("foo"));
        let (callback, _rx) = recorder();
        let handle = channel.consume("jobs", callback, &options).await.unwrap();
        assert_eq!(handle.tag(), "foo");
    }

    #[tokio::test]
    async fn test_connection_error_reaches_listener_until_closed() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("amqp://x/").await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        connection.on_error(Box::new(move |err: BrokerError| sink.lock().unwrap().push(err.to_string())));

        broker.emit_connection_error("foo");
        connection.close().await.unwrap();
        broker.emit_connection_error("bar");

        assert_eq!(seen.lock().unwrap().as_slice(), ["foo"]);
    }

    #[tokio::test]
    async fn test_dropped_connection_stops_listening() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("amqp://x/").await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        connection.on_error(Box::new(move |err: BrokerError| sink.lock().unwrap().push(err.to_string())));

        drop(connection);
        broker.emit_connection_error("foo");

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_calls_empties_log() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.publish("jobs", vec![1], &Options::new()).await.unwrap();

        broker.clear_calls();

        assert!(broker.calls().is_empty());
        assert_eq!(broker.ready("jobs"), 1);
    }
}
