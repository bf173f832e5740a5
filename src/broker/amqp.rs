//! Broker client backed by `lapin`.
//!
//! Destinations are plain queues. Publishing goes through the default exchange
//! with the queue name as routing key.

use super::{BrokerChannel, BrokerClient, BrokerConnection, ConsumerHandle, Delivery, DeliveryCallback, ErrorCallback};
use crate::error::BrokerError;
use crate::options::{decode, Options};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions,
        QueueDeleteOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

const REPLY_SUCCESS: u16 = 200;

/// Opens AMQP 0.9.1 connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpClient;

impl AmqpClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerClient for AmqpClient {
    async fn connect(&self, target: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect(target, ConnectionProperties::default()).await?;
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn on_error(&self, callback: ErrorCallback) {
        self.inner.on_error(move |err| callback(BrokerError::from(err)));
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeclareArgs {
    passive: bool,
    durable: bool,
    exclusive: bool,
    #[serde(alias = "autoDelete")]
    auto_delete: bool,
    nowait: bool,
    arguments: Options,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConsumeArgs {
    #[serde(alias = "consumerTag")]
    consumer_tag: String,
    #[serde(alias = "noLocal")]
    no_local: bool,
    #[serde(alias = "noAck")]
    no_ack: bool,
    exclusive: bool,
    nowait: bool,
    arguments: Options,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PublishArgs {
    mandatory: bool,
    immediate: bool,
    persistent: bool,
    #[serde(alias = "contentType")]
    content_type: Option<String>,
    #[serde(alias = "contentEncoding")]
    content_encoding: Option<String>,
    priority: Option<u8>,
    #[serde(alias = "correlationId")]
    correlation_id: Option<String>,
    #[serde(alias = "replyTo")]
    reply_to: Option<String>,
    expiration: Option<Value>,
    #[serde(alias = "messageId")]
    message_id: Option<String>,
    headers: Option<Options>,
}

impl PublishArgs {
    fn properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default();
        if self.persistent {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(content_type) = &self.content_type {
            properties = properties.with_content_type(short(content_type));
        }
        if let Some(encoding) = &self.content_encoding {
            properties = properties.with_content_encoding(short(encoding));
        }
        if let Some(priority) = self.priority {
            properties = properties.with_priority(priority);
        }
        if let Some(id) = &self.correlation_id {
            properties = properties.with_correlation_id(short(id));
        }
        if let Some(reply_to) = &self.reply_to {
            properties = properties.with_reply_to(short(reply_to));
        }
        if let Some(expiration) = &self.expiration {
            // May arrive as a number of milliseconds; AMQP wants a string.
            let expiration = match expiration {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            properties = properties.with_expiration(ShortString::from(expiration));
        }
        if let Some(id) = &self.message_id {
            properties = properties.with_message_id(short(id));
        }
        if let Some(headers) = &self.headers {
            properties = properties.with_headers(field_table(headers));
        }
        properties
    }
}

struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare(&self, destination: &str, options: &Options) -> Result<(), BrokerError> {
        let args: DeclareArgs = decode(options)?;
        self.inner
            .queue_declare(
                destination,
                QueueDeclareOptions {
                    passive: args.passive,
                    durable: args.durable,
                    exclusive: args.exclusive,
                    auto_delete: args.auto_delete,
                    nowait: args.nowait,
                },
                field_table(&args.arguments),
            )
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        destination: &str,
        callback: DeliveryCallback,
        options: &Options,
    ) -> Result<ConsumerHandle, BrokerError> {
        let args: ConsumeArgs = decode(options)?;
        let mut consumer = self
            .inner
            .basic_consume(
                destination,
                &args.consumer_tag,
                BasicConsumeOptions {
                    no_local: args.no_local,
                    no_ack: args.no_ack,
                    exclusive: args.exclusive,
                    nowait: args.nowait,
                },
                field_table(&args.arguments),
            )
            .await?;

        let tag = consumer.tag().as_str().to_string();
        let loop_tag = tag.clone();
        let destination = destination.to_string();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => callback(into_delivery(&destination, delivery)).await,
                    Err(e) => {
                        log::error!("Consumer '{}' on '{}' stopped: {}", loop_tag, destination, e);
                        break;
                    }
                }
            }
            log::info!("Consumer '{}' on '{}' finished", loop_tag, destination);
        });

        Ok(ConsumerHandle::new(tag))
    }

    async fn publish(&self, destination: &str, payload: Vec<u8>, options: &Options) -> Result<(), BrokerError> {
        let args: PublishArgs = decode(options)?;
        let _confirm = self
            .inner
            .basic_publish(
                "",
                destination,
                BasicPublishOptions { mandatory: args.mandatory, immediate: args.immediate },
                &payload,
                args.properties(),
            )
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner.basic_ack(delivery_tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.inner
            .basic_nack(delivery_tag, BasicNackOptions { requeue, ..Default::default() })
            .await?;
        Ok(())
    }

    async fn purge(&self, destination: &str) -> Result<u32, BrokerError> {
        Ok(self.inner.queue_purge(destination, QueuePurgeOptions::default()).await?)
    }

    async fn delete(&self, destination: &str) -> Result<u32, BrokerError> {
        Ok(self.inner.queue_delete(destination, QueueDeleteOptions::default()).await?)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

fn into_delivery(destination: &str, delivery: lapin::message::Delivery) -> Delivery {
    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str().to_string());
    Delivery {
        destination: destination.to_string(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        body: delivery.data,
        content_type,
    }
}

fn short(s: &str) -> ShortString {
    ShortString::from(s.to_string())
}

fn field_table(map: &Options) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in map {
        table.insert(short(key), amqp_value(value));
    }
    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>())),
        Value::Object(map) => AMQPValue::FieldTable(field_table(map)),
    }
}
