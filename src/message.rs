//! Application payloads and the serialization hook that turns them into bytes.

use crate::error::WorkerError;
use serde_json::Value;

/// An application message handed to `Worker::publish`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Bytes(Vec<u8>),
    Text(String),
    Json(Value),
}

impl Message {
    /// A short name for the payload kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Bytes(_) => "bytes",
            Message::Text(_) => "text",
            Message::Json(_) => "json",
        }
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::Bytes(bytes)
    }
}

impl From<&[u8]> for Message {
    fn from(bytes: &[u8]) -> Self {
        Message::Bytes(bytes.to_vec())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::Json(value)
    }
}

/// Reduces a `Message` to the raw bytes sent to the broker.
pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, message: Message) -> Result<Vec<u8>, WorkerError>;
}

impl<F> MessageSerializer for F
where
    F: Fn(Message) -> Result<Vec<u8>, WorkerError> + Send + Sync,
{
    fn serialize(&self, message: Message) -> Result<Vec<u8>, WorkerError> {
        self(message)
    }
}

/// Identity serializer: only raw bytes are accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytes;

impl MessageSerializer for RawBytes {
    fn serialize(&self, message: Message) -> Result<Vec<u8>, WorkerError> {
        match message {
            Message::Bytes(bytes) => Ok(bytes),
            other => Err(WorkerError::InvalidPayload(format!(
                "expected raw bytes, got {}",
                other.kind()
            ))),
        }
    }
}

/// Encodes text as UTF-8; bytes pass through, JSON is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8;

impl MessageSerializer for Utf8 {
    fn serialize(&self, message: Message) -> Result<Vec<u8>, WorkerError> {
        match message {
            Message::Bytes(bytes) => Ok(bytes),
            Message::Text(text) => Ok(text.into_bytes()),
            Message::Json(_) => Err(WorkerError::InvalidPayload("expected text or bytes, got json".to_string())),
        }
    }
}

/// Encodes text and JSON values as JSON documents; bytes pass through.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl MessageSerializer for Json {
    fn serialize(&self, message: Message) -> Result<Vec<u8>, WorkerError> {
        let value = match message {
            Message::Bytes(bytes) => return Ok(bytes),
            Message::Text(text) => Value::String(text),
            Message::Json(value) => value,
        };
        serde_json::to_vec(&value).map_err(|e| WorkerError::InvalidPayload(e.to_string()))
    }
}
