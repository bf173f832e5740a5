use async_trait::async_trait;
use queue_worker::{AmqpClient, Delivery, MessageHandler, Worker, WorkerConfig, WorkerError};
use serde_json::json;
use std::sync::Arc;

// 1. Implement the `MessageHandler` trait for your logic
struct PrintHandler;

#[async_trait]
impl MessageHandler for PrintHandler {
    fn handler_name(&self) -> &str {
        "PrintHandler"
    }

    async fn handle_message(&self, delivery: Delivery) -> Result<(), WorkerError> {
        let body = String::from_utf8(delivery.body)
            .map_err(|e| WorkerError::from(format!("Body is not UTF-8: {}", e)))?;
        log::info!("Received message {} on '{}': {}", delivery.delivery_tag, delivery.destination, body);
        Ok(())
    }
}

// 2. Configure the worker, subscribe, publish, and tear down on Ctrl+C
#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Host, port and credentials come from BROKER_HOST, BROKER_PORT, BROKER_USER and BROKER_PASS.
    let config = WorkerConfig::builder()
        .destination("round_trip_demo")
        .consume_options(queue_worker::options::from_json(json!({ "no_ack": true })))
        .build();
    log::info!("Using broker at {}", config.redacted_target());

    let worker = Arc::new(
        Worker::new(AmqpClient::new(), config)
            .with_handler(PrintHandler)
            .with_serializer(queue_worker::message::Utf8)
            .with_error_sink(|e| log::error!("Broker fault: {}", e))
            .before_teardown(|| async {
                log::info!("Shutting down consumer...");
                Ok::<(), WorkerError>(())
            }),
    );

    worker.subscribe().await?;
    worker.publish("hello world").await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| WorkerError::from(format!("Failed to listen for Ctrl+C: {}", e)))?;
    log::info!("Ctrl+C received. Shutting down.");

    worker.teardown().await?;
    log::info!("Application has shut down.");
    Ok(())
}
