//! AWS clients behind the adapter traits, and router wiring from config.

use std::sync::Arc;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_lambda::types::InvocationType;
use aws_sdk_s3::primitives::ByteStream;
use relay_core::config::{
    RelayConfig, ARCHIVE_BUCKET_VAR, DEAD_LETTER_QUEUE_URL_VAR, QUEUE_URLS_VAR, QUEUE_URL_VAR,
};
use relay_core::queue::QueueSink;
use relay_core::routing::{Destination, EventSink, Router, SinkMap};
use relay_core::RelayError;

use crate::adapters::invoke::{FunctionInvoker, FunctionSink};
use crate::adapters::object_store::{ArchiveSink, ObjectStore};
use crate::adapters::sqs_queue::{SqsDeadLetterQueue, SqsQueue};

pub struct S3ObjectStore {
    bucket: String,
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(bucket: impl Into<String>, client: aws_sdk_s3::Client) -> Self {
        Self {
            bucket: bucket.into(),
            client,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn write_object(&self, key: &str, body: &[u8]) -> Result<(), String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body.to_vec()))
            .send()
            .await
            .map(|_| ())
            .map_err(|error| format!("failed to write object to s3: {error}"))
    }
}

pub struct LambdaInvoker {
    client: aws_sdk_lambda::Client,
}

impl LambdaInvoker {
    pub fn new(client: aws_sdk_lambda::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FunctionInvoker for LambdaInvoker {
    async fn invoke_async(&self, function_name: &str, payload: &[u8]) -> Result<String, String> {
        let output = self
            .client
            .invoke()
            .function_name(function_name)
            .invocation_type(InvocationType::Event)
            .set_payload(Some(payload.to_vec().into()))
            .send()
            .await
            .map_err(|error| format!("failed to invoke function: {error}"))?;
        Ok(format!("{function_name}:{}", output.status_code()))
    }
}

/// Shared service clients, built once per process.
#[derive(Clone)]
pub struct AwsClients {
    pub sqs: aws_sdk_sqs::Client,
    pub s3: aws_sdk_s3::Client,
    pub lambda: aws_sdk_lambda::Client,
}

impl AwsClients {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            sqs: aws_sdk_sqs::Client::new(config),
            s3: aws_sdk_s3::Client::new(config),
            lambda: aws_sdk_lambda::Client::new(config),
        }
    }

    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(&config)
    }

    /// Queue adapter for the configured primary queue. Messages received
    /// more than `max_receive_count` times move to the dead-letter queue.
    pub fn primary_queue(&self, config: &RelayConfig) -> Result<SqsQueue, RelayError> {
        let url = config.queue.url.clone().ok_or_else(|| {
            RelayError::Config(format!("{QUEUE_URL_VAR} must be configured"))
        })?;
        let dead_letters = self.dead_letter_queue(config)?;
        Ok(SqsQueue::new(config.queue.name.clone(), url, self.sqs.clone())
            .with_dead_letters(Arc::new(dead_letters), config.queue.max_receive_count))
    }

    pub fn dead_letter_queue(&self, config: &RelayConfig) -> Result<SqsDeadLetterQueue, RelayError> {
        let url = config.queue.dead_letter_url.clone().ok_or_else(|| {
            RelayError::Config(format!("{DEAD_LETTER_QUEUE_URL_VAR} must be configured"))
        })?;
        Ok(SqsDeadLetterQueue::new(url, self.sqs.clone()))
    }

    /// Binds every destination in the routing table to its AWS adapter.
    pub fn router(&self, config: &RelayConfig) -> Result<Router, RelayError> {
        let mut sinks = SinkMap::new();
        for destination in config.routing.destinations() {
            let sink: Arc<dyn EventSink> = match destination {
                Destination::Queue { name } => {
                    let url = config.queue.url_for(name).ok_or_else(|| {
                        RelayError::Config(format!(
                            "no URL for queue '{name}'; set {QUEUE_URL_VAR} or {QUEUE_URLS_VAR}"
                        ))
                    })?;
                    Arc::new(QueueSink::new(Arc::new(SqsQueue::new(
                        name.clone(),
                        url,
                        self.sqs.clone(),
                    ))))
                }
                Destination::Archive { prefix } => {
                    let bucket = config.archive_bucket.clone().ok_or_else(|| {
                        RelayError::Config(format!(
                            "{ARCHIVE_BUCKET_VAR} must be configured for archive destinations"
                        ))
                    })?;
                    Arc::new(ArchiveSink::new(
                        S3ObjectStore::new(bucket, self.s3.clone()),
                        prefix.clone(),
                    ))
                }
                Destination::Function { name } => Arc::new(FunctionSink::new(
                    LambdaInvoker::new(self.lambda.clone()),
                    name.clone(),
                )),
            };
            sinks.insert(destination.clone(), sink);
        }
        Router::new(config.routing.clone(), sinks)
    }
}
