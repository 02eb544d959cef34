use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::contract::{body_digest, BatchResponse, Event};
use relay_core::queue::{dead_letter_reason, exceeds_receive_limit, DeadLetterSink, QueueMessage};
use relay_core::worker::{process_message, MessageHandler};
use relay_core::RelayError;
use serde_json::Value;
use tokio::task::JoinSet;

use crate::adapters::sqs_queue::verify_body_md5;

const SQS_EVENT_SOURCE: &str = "aws:sqs";

pub fn is_sqs_event(event: &Value) -> bool {
    event
        .get("Records")
        .and_then(Value::as_array)
        .map(|records| {
            !records.is_empty()
                && records.iter().all(|record| {
                    record
                        .get("eventSource")
                        .and_then(Value::as_str)
                        .map(|source| source == SQS_EVENT_SOURCE)
                        .unwrap_or(false)
                })
        })
        .unwrap_or(false)
}

/// One record of an SQS batch notification.
#[derive(Debug, Clone, PartialEq)]
pub struct SqsRecord {
    pub message: QueueMessage,
    /// Checksum the queue service computed when the body was sent.
    pub md5_of_body: Option<String>,
}

/// Turns an SQS batch notification into queue records. A record without a
/// message id cannot be reported back individually, so it fails the batch.
pub fn decode_sqs_records(event: &Value, now: DateTime<Utc>) -> Result<Vec<SqsRecord>, RelayError> {
    let records = event
        .get("Records")
        .and_then(Value::as_array)
        .ok_or_else(|| RelayError::MalformedInput("SQS event must include Records array".to_string()))?;

    let mut decoded = Vec::with_capacity(records.len());
    for record in records {
        let message_id = record
            .get("messageId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RelayError::MalformedInput("SQS record must include a messageId".to_string())
            })?;
        let body = record
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let attribute = |name: &str| {
            record
                .get("attributes")
                .and_then(|attributes| attributes.get(name))
                .and_then(Value::as_str)
        };
        let receive_count = attribute("ApproximateReceiveCount")
            .and_then(|value| value.parse().ok())
            .unwrap_or(1);
        let sent_at = attribute("SentTimestamp")
            .and_then(|value| value.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(now);

        decoded.push(SqsRecord {
            message: QueueMessage {
                message_id: message_id.to_string(),
                body_digest: body_digest(&body),
                body,
                receive_count,
                visible_after: now,
                sent_at,
            },
            md5_of_body: record
                .get("md5OfBody")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }
    Ok(decoded)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RecordOutcome {
    Processed { event_id: String },
    DeadLettered { receipt: String },
}

/// Consumes SQS batches delivered by an event source mapping. Records run
/// concurrently and independently; only failed ones are reported back for
/// redelivery, the mapping deletes the rest.
pub struct SqsBatchConsumer {
    handler: Arc<dyn MessageHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    handler_timeout: Duration,
    max_receive_count: u32,
}

impl SqsBatchConsumer {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        dead_letters: Arc<dyn DeadLetterSink>,
        handler_timeout: Duration,
        max_receive_count: u32,
    ) -> Self {
        Self {
            handler,
            dead_letters,
            handler_timeout,
            max_receive_count,
        }
    }

    pub async fn handle_batch(&self, event: &Value) -> Result<BatchResponse, RelayError> {
        let records = decode_sqs_records(event, Utc::now())?;
        let received = records.len();
        let mut pending: BTreeMap<usize, String> = BTreeMap::new();
        let mut tasks = JoinSet::new();

        for (index, record) in records.into_iter().enumerate() {
            pending.insert(index, record.message.message_id.clone());
            let handler = Arc::clone(&self.handler);
            let dead_letters = Arc::clone(&self.dead_letters);
            let handler_timeout = self.handler_timeout;
            let max_receive_count = self.max_receive_count;
            tasks.spawn(async move {
                let outcome = handle_record(
                    handler.as_ref(),
                    dead_letters.as_ref(),
                    &record,
                    handler_timeout,
                    max_receive_count,
                )
                .await;
                (index, record.message, outcome)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, message, outcome) = match joined {
                Ok(value) => value,
                Err(join_error) => {
                    tracing::error!(error = %join_error, "record task aborted");
                    continue;
                }
            };
            pending.remove(&index);
            match outcome {
                Ok(RecordOutcome::Processed { event_id }) => tracing::info!(
                    message_id = %message.message_id,
                    event_id = %event_id,
                    receive_count = message.receive_count,
                    "message processed"
                ),
                Ok(RecordOutcome::DeadLettered { receipt }) => tracing::warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    dead_letter_receipt = %receipt,
                    "message dead-lettered"
                ),
                Err(error) => {
                    tracing::warn!(
                        message_id = %message.message_id,
                        receive_count = message.receive_count,
                        error = %error,
                        "message processing failed"
                    );
                    failed.push((index, message.message_id));
                }
            }
        }
        // Records whose task never reported back are retried as well.
        failed.extend(pending);
        failed.sort();

        let mut response = BatchResponse::default();
        for (_, message_id) in failed {
            response.fail(message_id);
        }
        tracing::info!(
            received,
            failed = response.batch_item_failures.len(),
            "sqs batch handled"
        );
        Ok(response)
    }
}

/// Dead-letters a record past the receive limit without running the
/// handler; otherwise checks the service checksum and processes it.
async fn handle_record(
    handler: &dyn MessageHandler,
    dead_letters: &dyn DeadLetterSink,
    record: &SqsRecord,
    handler_timeout: Duration,
    max_receive_count: u32,
) -> Result<RecordOutcome, RelayError> {
    let message = &record.message;
    if exceeds_receive_limit(message.receive_count, max_receive_count) {
        let receipt = dead_letters
            .dead_letter(message, &dead_letter_reason(max_receive_count))
            .await?;
        return Ok(RecordOutcome::DeadLettered { receipt });
    }

    verify_body_md5(&message.body, record.md5_of_body.as_deref())
        .map_err(|reason| RelayError::processing(&message.message_id, reason))?;
    let event = process_message(handler, message, handler_timeout).await?;
    Ok(RecordOutcome::Processed { event_id: event.id })
}

/// Default business handler: records the event it was given.
pub struct LogEventHandler;

#[async_trait]
impl MessageHandler for LogEventHandler {
    async fn handle(&self, event: &Event, message: &QueueMessage) -> Result<(), String> {
        let detail = serde_json::to_string(&event.detail)
            .map_err(|error| format!("event detail is not serializable: {error}"))?;
        tracing::info!(
            event_id = %event.id,
            message_id = %message.message_id,
            source = %event.source,
            detail_type = %event.detail_type,
            detail = %detail,
            "processing event"
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Instant;

    use relay_core::contract::Detail;
    use md5::{Digest, Md5};
    use relay_core::worker::{DeduplicatingHandler, HandlerFn};
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct CapturingDeadLetters {
        letters: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl CapturingDeadLetters {
        fn letters(&self) -> Vec<(String, String)> {
            self.letters.lock().expect("poisoned mutex").clone()
        }
    }

    #[async_trait]
    impl DeadLetterSink for CapturingDeadLetters {
        async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<String, RelayError> {
            if self.fail {
                return Err(RelayError::delivery("dead-letter queue", "unavailable"));
            }
            self.letters
                .lock()
                .expect("poisoned mutex")
                .push((message.message_id.clone(), reason.to_string()));
            Ok(format!("dlq-{}", message.message_id))
        }
    }

    fn order_event(order_id: &str) -> Event {
        let mut detail = Detail::new();
        detail.insert("orderId".to_string(), json!(order_id));
        Event::new("myapp", "order", detail, Utc::now())
    }

    fn record(message_id: &str, body: &str, receive_count: u32) -> Value {
        json!({
            "messageId": message_id,
            "receiptHandle": format!("rh-{message_id}"),
            "body": body,
            "attributes": {
                "ApproximateReceiveCount": receive_count.to_string(),
                "SentTimestamp": "1792233000000"
            },
            "eventSource": "aws:sqs"
        })
    }

    fn batch(records: Vec<Value>) -> Value {
        json!({ "Records": records })
    }

    fn body_of(event: &Event) -> String {
        event.to_body().expect("event should serialize")
    }

    fn consumer(
        handler: Arc<dyn MessageHandler>,
        dead_letters: Arc<CapturingDeadLetters>,
        handler_timeout: Duration,
    ) -> SqsBatchConsumer {
        SqsBatchConsumer::new(handler, dead_letters, handler_timeout, 5)
    }

    fn failed_ids(response: &BatchResponse) -> Vec<&str> {
        response
            .batch_item_failures
            .iter()
            .map(|failure| failure.item_identifier.as_str())
            .collect()
    }

    fn counting_handler(calls: Arc<Mutex<usize>>) -> Arc<dyn MessageHandler> {
        Arc::new(HandlerFn(move |_event: Event| {
            *calls.lock().expect("poisoned mutex") += 1;
            async { Err::<(), String>("downstream unavailable".to_string()) }
        }))
    }

    #[test]
    fn detects_sqs_events() {
        assert!(is_sqs_event(&batch(vec![record("m-1", "{}", 1)])));
        assert!(!is_sqs_event(&json!({ "Records": [] })));
        assert!(!is_sqs_event(&json!({ "Records": [{"eventSource": "aws:s3"}] })));
        assert!(!is_sqs_event(&json!({ "body": "{}" })));
    }

    #[test]
    fn decodes_record_attributes() {
        let now = Utc::now();
        let mut raw = record("m-1", "{}", 3);
        raw["md5OfBody"] = json!("99914b932bd37a50b983c5e7c90ae93b");
        let records = decode_sqs_records(&batch(vec![raw]), now).expect("records should decode");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message.message_id, "m-1");
        assert_eq!(records[0].message.receive_count, 3);
        assert_eq!(records[0].message.sent_at.timestamp_millis(), 1_792_233_000_000);
        assert_eq!(records[0].message.body_digest, body_digest("{}"));
        assert_eq!(
            records[0].md5_of_body.as_deref(),
            Some("99914b932bd37a50b983c5e7c90ae93b")
        );
    }

    #[test]
    fn record_without_message_id_fails_the_batch() {
        let error = decode_sqs_records(&batch(vec![json!({"body": "{}"})]), Utc::now())
            .expect_err("record should be rejected");
        assert!(matches!(error, RelayError::MalformedInput(_)));
    }

    #[tokio::test]
    async fn reports_only_failed_records() {
        let good = order_event("A1");
        let bad = order_event("FAIL");
        let event = batch(vec![
            record("m-good", &body_of(&good), 1),
            record("m-bad", &body_of(&bad), 2),
            record("m-garbled", "not json", 1),
        ]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let handler = HandlerFn(move |event: Event| {
            let order_id = event.detail["orderId"].as_str().unwrap_or_default().to_string();
            captured.lock().expect("poisoned mutex").push(order_id.clone());
            async move {
                if order_id == "FAIL" {
                    Err("order rejected".to_string())
                } else {
                    Ok(())
                }
            }
        });
        let dead_letters = Arc::new(CapturingDeadLetters::default());

        let response = consumer(Arc::new(handler), dead_letters.clone(), Duration::from_secs(1))
            .handle_batch(&event)
            .await
            .expect("batch should be handled");

        assert_eq!(failed_ids(&response), vec!["m-bad", "m-garbled"]);
        let mut seen = seen.lock().expect("poisoned mutex").clone();
        seen.sort();
        assert_eq!(seen, vec!["A1", "FAIL"]);
        assert!(dead_letters.letters().is_empty());
    }

    #[tokio::test]
    async fn record_past_receive_limit_is_dead_lettered_without_handling() {
        let calls = Arc::new(Mutex::new(0usize));
        let dead_letters = Arc::new(CapturingDeadLetters::default());
        let event = batch(vec![
            record("m-1", &body_of(&order_event("X1")), 500),
            record("m-2", &body_of(&order_event("X2")), 5),
        ]);

        let response = consumer(
            counting_handler(calls.clone()),
            dead_letters.clone(),
            Duration::from_secs(1),
        )
        .handle_batch(&event)
        .await
        .expect("batch should be handled");

        assert_eq!(failed_ids(&response), vec!["m-2"]);
        assert_eq!(*calls.lock().expect("poisoned mutex"), 1);
        assert_eq!(
            dead_letters.letters(),
            vec![(
                "m-1".to_string(),
                "receive count exceeded max_receive_count=5".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn unavailable_dead_letter_queue_keeps_record_for_retry() {
        let calls = Arc::new(Mutex::new(0usize));
        let dead_letters = Arc::new(CapturingDeadLetters {
            fail: true,
            ..CapturingDeadLetters::default()
        });
        let event = batch(vec![record("m-1", &body_of(&order_event("X1")), 6)]);

        let response = consumer(counting_handler(calls.clone()), dead_letters, Duration::from_secs(1))
            .handle_batch(&event)
            .await
            .expect("batch should be handled");

        assert_eq!(failed_ids(&response), vec!["m-1"]);
        assert_eq!(*calls.lock().expect("poisoned mutex"), 0);
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_record_before_handler() {
        let calls = Arc::new(Mutex::new(0usize));
        let mut corrupted = record("m-1", &body_of(&order_event("C1")), 1);
        corrupted["md5OfBody"] = json!("00000000000000000000000000000000");

        let response = consumer(
            counting_handler(calls.clone()),
            Arc::new(CapturingDeadLetters::default()),
            Duration::from_secs(1),
        )
        .handle_batch(&batch(vec![corrupted]))
        .await
        .expect("batch should be handled");

        assert_eq!(failed_ids(&response), vec!["m-1"]);
        assert_eq!(*calls.lock().expect("poisoned mutex"), 0);
    }

    #[tokio::test]
    async fn matching_checksum_is_processed() {
        let body = body_of(&order_event("M1"));
        let mut raw = record("m-1", &body, 1);
        raw["md5OfBody"] = json!(format!("{:x}", Md5::digest(body.as_bytes())));
        let handler = HandlerFn(|_event: Event| async { Ok::<(), String>(()) });

        let response = consumer(
            Arc::new(handler),
            Arc::new(CapturingDeadLetters::default()),
            Duration::from_secs(1),
        )
        .handle_batch(&batch(vec![raw]))
        .await
        .expect("batch should be handled");

        assert!(response.batch_item_failures.is_empty());
    }

    #[tokio::test]
    async fn slow_handler_is_reported_as_failure() {
        let event = batch(vec![record("m-slow", &body_of(&order_event("S1")), 1)]);
        let handler = HandlerFn(|_event: Event| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<(), String>(())
        });

        let response = consumer(
            Arc::new(handler),
            Arc::new(CapturingDeadLetters::default()),
            Duration::from_millis(20),
        )
        .handle_batch(&event)
        .await
        .expect("batch should be handled");

        assert_eq!(failed_ids(&response), vec!["m-slow"]);
    }

    #[tokio::test]
    async fn records_are_processed_concurrently() {
        let records = (0..5)
            .map(|index| record(&format!("m-{index}"), &body_of(&order_event("P1")), 1))
            .collect();
        let handler = HandlerFn(|_event: Event| async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok::<(), String>(())
        });

        let started = Instant::now();
        let response = consumer(
            Arc::new(handler),
            Arc::new(CapturingDeadLetters::default()),
            Duration::from_secs(2),
        )
        .handle_batch(&batch(records))
        .await
        .expect("batch should be handled");

        assert!(response.batch_item_failures.is_empty());
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn redelivered_duplicate_is_skipped_after_success() {
        let event = order_event("D1");
        let calls = Arc::new(Mutex::new(0usize));
        let counted = Arc::clone(&calls);
        let handler = DeduplicatingHandler::new(
            HandlerFn(move |_event: Event| {
                *counted.lock().expect("poisoned mutex") += 1;
                async { Ok::<(), String>(()) }
            }),
            16,
        );
        let consumer = consumer(
            Arc::new(handler),
            Arc::new(CapturingDeadLetters::default()),
            Duration::from_secs(1),
        );

        for (message_id, receive_count) in [("m-1", 1), ("m-1", 2)] {
            let response = consumer
                .handle_batch(&batch(vec![record(message_id, &body_of(&event), receive_count)]))
                .await
                .expect("batch should be handled");
            assert!(response.batch_item_failures.is_empty());
        }
        assert_eq!(*calls.lock().expect("poisoned mutex"), 1);
    }

    #[tokio::test]
    async fn log_handler_accepts_any_event() {
        let event = order_event("L1");
        let message = QueueMessage::new(&event, Utc::now()).expect("message should build");
        LogEventHandler
            .handle(&event, &message)
            .await
            .expect("logging never fails");
    }
}
