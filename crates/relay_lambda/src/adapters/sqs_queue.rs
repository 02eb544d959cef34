use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{Message, MessageAttributeValue, MessageSystemAttributeName};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use relay_core::clock::add_duration;
use relay_core::contract::{body_digest, Event};
use relay_core::queue::{
    dead_letter_reason, exceeds_receive_limit, AckOutcome, DeadLetterSink, MessageQueue,
    QueueMessage,
};
use relay_core::RelayError;

/// Service limits on a single receive call.
const MAX_RECEIVE_BATCH: usize = 10;
const MAX_WAIT_SECS: u64 = 20;
const MAX_VISIBILITY_SECS: u64 = 43_200;

pub const DEAD_LETTER_REASON_ATTRIBUTE: &str = "RelayDeadLetterReason";
pub const SOURCE_MESSAGE_ID_ATTRIBUTE: &str = "RelaySourceMessageId";

/// Checks a body against the MD5 digest the queue service reported for it.
/// A missing digest is accepted.
pub fn verify_body_md5(body: &str, expected: Option<&str>) -> Result<(), String> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let actual = format!("{:x}", Md5::digest(body.as_bytes()));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(format!(
            "body MD5 {actual} does not match the service checksum {expected}"
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Receipt {
    handle: String,
    expires_at: DateTime<Utc>,
}

/// Drops receipt handles whose visibility window has closed. Once that
/// happens the service may hand the message to another consumer, so the
/// handle is no longer ours to use.
fn prune_expired(receipts: &mut HashMap<String, Receipt>, now: DateTime<Utc>) {
    receipts.retain(|_, receipt| receipt.expires_at > now);
}

struct DeadLetterPolicy {
    sink: Arc<dyn DeadLetterSink>,
    max_receive_count: u32,
}

/// [`MessageQueue`] backed by an SQS queue. The service addresses in-flight
/// messages by receipt handle, so the latest handle per message id is kept
/// until the message is acknowledged or its visibility window closes.
pub struct SqsQueue {
    name: String,
    queue_url: String,
    client: aws_sdk_sqs::Client,
    receipts: Mutex<HashMap<String, Receipt>>,
    dead_letters: Option<DeadLetterPolicy>,
}

impl SqsQueue {
    pub fn new(
        name: impl Into<String>,
        queue_url: impl Into<String>,
        client: aws_sdk_sqs::Client,
    ) -> Self {
        Self {
            name: name.into(),
            queue_url: queue_url.into(),
            client,
            receipts: Mutex::new(HashMap::new()),
            dead_letters: None,
        }
    }

    /// Moves messages delivered more than `max_receive_count` times to `sink`
    /// on receive instead of returning them.
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>, max_receive_count: u32) -> Self {
        self.dead_letters = Some(DeadLetterPolicy {
            sink,
            max_receive_count,
        });
        self
    }

    fn destination(&self) -> String {
        format!("queue:{}", self.name)
    }

    fn receipts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Receipt>> {
        self.receipts.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), RelayError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map(|_| ())
            .map_err(|error| {
                RelayError::delivery(
                    self.destination(),
                    format!("failed to delete message: {}", DisplayErrorContext(&error)),
                )
            })
    }

    /// Copies the message to the dead-letter sink, then deletes it here. A
    /// failure leaves the message on the queue to be tried again.
    async fn move_to_dead_letters(
        &self,
        policy: &DeadLetterPolicy,
        message: &QueueMessage,
        receipt_handle: &str,
    ) {
        let reason = dead_letter_reason(policy.max_receive_count);
        let moved = match policy.sink.dead_letter(message, &reason).await {
            Ok(_) => self.delete(receipt_handle).await,
            Err(error) => Err(error),
        };
        match moved {
            Ok(()) => tracing::warn!(
                queue = %self.name,
                message_id = %message.message_id,
                receive_count = message.receive_count,
                "message dead-lettered"
            ),
            Err(error) => tracing::error!(
                queue = %self.name,
                message_id = %message.message_id,
                error = %error,
                "failed to dead-letter message"
            ),
        }
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, event: &Event) -> Result<String, RelayError> {
        let body = event.to_body()?;
        let output = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|error| {
                RelayError::delivery(
                    self.destination(),
                    format!("failed to send message: {}", DisplayErrorContext(&error)),
                )
            })?;
        output
            .message_id()
            .map(str::to_string)
            .ok_or_else(|| RelayError::delivery(self.destination(), "send returned no message id"))
    }

    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, RelayError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let visibility_secs = visibility_timeout.as_secs().min(MAX_VISIBILITY_SECS);
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(MAX_RECEIVE_BATCH) as i32)
            .visibility_timeout(visibility_secs as i32)
            .wait_time_seconds(wait.as_secs().min(MAX_WAIT_SECS) as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .message_system_attribute_names(MessageSystemAttributeName::SentTimestamp)
            .send()
            .await
            .map_err(|error| {
                RelayError::delivery(
                    self.destination(),
                    format!("failed to receive messages: {}", DisplayErrorContext(&error)),
                )
            })?;

        let now = Utc::now();
        let visible_after = add_duration(now, Duration::from_secs(visibility_secs));
        let mut batch = Vec::with_capacity(output.messages().len());
        let mut held = Vec::with_capacity(output.messages().len());
        for message in output.messages() {
            let (Some(message_id), Some(receipt_handle)) =
                (message.message_id(), message.receipt_handle())
            else {
                tracing::warn!(queue = %self.name, "skipping message without id or receipt handle");
                continue;
            };
            let converted = to_queue_message(message_id, message, visible_after, now);

            if let Some(policy) = &self.dead_letters {
                if exceeds_receive_limit(converted.receive_count, policy.max_receive_count) {
                    self.move_to_dead_letters(policy, &converted, receipt_handle)
                        .await;
                    continue;
                }
            }

            if let Err(reason) = verify_body_md5(&converted.body, message.md5_of_body()) {
                tracing::warn!(
                    queue = %self.name,
                    message_id = %message_id,
                    reason = %reason,
                    "skipping corrupted message until redelivery"
                );
                continue;
            }

            held.push((
                message_id.to_string(),
                Receipt {
                    handle: receipt_handle.to_string(),
                    expires_at: visible_after,
                },
            ));
            batch.push(converted);
        }

        let mut receipts = self.receipts();
        prune_expired(&mut receipts, now);
        receipts.extend(held);
        Ok(batch)
    }

    async fn acknowledge(&self, message_id: &str) -> Result<AckOutcome, RelayError> {
        let receipt = self.receipts().remove(message_id);
        let Some(receipt) = receipt else {
            return Ok(AckOutcome::AlreadyRemoved);
        };

        if let Err(error) = self.delete(&receipt.handle).await {
            self.receipts().insert(message_id.to_string(), receipt);
            return Err(error);
        }
        Ok(AckOutcome::Removed)
    }

    async fn extend_visibility(
        &self,
        message_id: &str,
        timeout: Duration,
    ) -> Result<(), RelayError> {
        let now = Utc::now();
        let receipt_handle = self
            .receipts()
            .get(message_id)
            .filter(|receipt| receipt.expires_at > now)
            .map(|receipt| receipt.handle.clone())
            .ok_or_else(|| RelayError::UnknownMessage(message_id.to_string()))?;

        let timeout_secs = timeout.as_secs().min(MAX_VISIBILITY_SECS);
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(timeout_secs as i32)
            .send()
            .await
            .map_err(|error| {
                RelayError::delivery(
                    self.destination(),
                    format!("failed to change visibility: {}", DisplayErrorContext(&error)),
                )
            })?;

        if let Some(receipt) = self.receipts().get_mut(message_id) {
            receipt.expires_at = add_duration(Utc::now(), Duration::from_secs(timeout_secs));
        }
        Ok(())
    }
}

/// Dead-letter queue on SQS. The copy carries the reason and the original
/// message id as message attributes.
pub struct SqsDeadLetterQueue {
    queue_url: String,
    client: aws_sdk_sqs::Client,
}

impl SqsDeadLetterQueue {
    pub fn new(queue_url: impl Into<String>, client: aws_sdk_sqs::Client) -> Self {
        Self {
            queue_url: queue_url.into(),
            client,
        }
    }
}

fn string_attribute(value: &str) -> Result<MessageAttributeValue, RelayError> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
        .map_err(|error| RelayError::delivery("dead-letter queue", error.to_string()))
}

#[async_trait]
impl DeadLetterSink for SqsDeadLetterQueue {
    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<String, RelayError> {
        let output = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(&message.body)
            .message_attributes(DEAD_LETTER_REASON_ATTRIBUTE, string_attribute(reason)?)
            .message_attributes(
                SOURCE_MESSAGE_ID_ATTRIBUTE,
                string_attribute(&message.message_id)?,
            )
            .send()
            .await
            .map_err(|error| {
                RelayError::delivery(
                    "dead-letter queue",
                    format!("failed to send dead letter: {}", DisplayErrorContext(&error)),
                )
            })?;
        Ok(output.message_id().unwrap_or_default().to_string())
    }
}

fn to_queue_message(
    message_id: &str,
    message: &Message,
    visible_after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> QueueMessage {
    let body = message.body().unwrap_or_default().to_string();
    let attribute = |name: MessageSystemAttributeName| {
        message
            .attributes()
            .and_then(|attributes| attributes.get(&name))
            .cloned()
    };
    let receive_count = attribute(MessageSystemAttributeName::ApproximateReceiveCount)
        .and_then(|value| value.parse().ok())
        .unwrap_or(1);
    let sent_at = attribute(MessageSystemAttributeName::SentTimestamp)
        .and_then(|value| value.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or(now);

    QueueMessage {
        message_id: message_id.to_string(),
        body_digest: body_digest(&body),
        body,
        receive_count,
        visible_after,
        sent_at,
    }
}
