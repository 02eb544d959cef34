use std::sync::Arc;

use lambda_runtime::{service_fn, Error, LambdaEvent};
use relay_core::config::RelayConfig;
use relay_core::worker::DeduplicatingHandler;
use relay_lambda::adapters::aws::AwsClients;
use relay_lambda::handlers::consumer::{is_sqs_event, LogEventHandler, SqsBatchConsumer};
use relay_lambda::telemetry::init_tracing;
use serde_json::Value;

/// Event ids remembered per warm container for duplicate suppression.
const DEDUP_CAPACITY: usize = 4_096;

struct ConsumerDependencies {
    consumer: SqsBatchConsumer,
}

async fn handle_request(
    event: LambdaEvent<Value>,
    deps: &ConsumerDependencies,
) -> Result<Value, Error> {
    if !is_sqs_event(&event.payload) {
        return Err(Error::from("consumer expects an SQS batch event"));
    }
    let response = deps.consumer.handle_batch(&event.payload).await?;
    serde_json::to_value(response)
        .map_err(|error| Error::from(format!("failed to serialize batch response: {error}")))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let config = RelayConfig::from_env()?;
    let clients = AwsClients::from_env().await;
    let deps = ConsumerDependencies {
        consumer: SqsBatchConsumer::new(
            Arc::new(DeduplicatingHandler::new(LogEventHandler, DEDUP_CAPACITY)),
            Arc::new(clients.dead_letter_queue(&config)?),
            config.worker.handler_timeout,
            config.queue.max_receive_count,
        ),
    };

    lambda_runtime::run(service_fn(|event| handle_request(event, &deps))).await
}
