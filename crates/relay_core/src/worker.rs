//! Consumer worker: receive a batch, process each message independently,
//! acknowledge only what succeeded.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::contract::Event;
use crate::error::RelayError;
use crate::queue::{AckOutcome, MessageQueue, QueueMessage};

pub const MAX_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(20);
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub visibility_timeout: Duration,
    pub wait_time: Duration,
    /// Must be shorter than `visibility_timeout`, otherwise a slow handler
    /// races a redelivery of its own message.
    pub handler_timeout: Duration,
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            wait_time: DEFAULT_WAIT_TIME,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(RelayError::Config(format!(
                "batch_size must be between 1 and {MAX_BATCH_SIZE}"
            )));
        }
        if self.handler_timeout.is_zero() {
            return Err(RelayError::Config(
                "handler_timeout must be positive".to_string(),
            ));
        }
        if self.handler_timeout >= self.visibility_timeout {
            return Err(RelayError::Config(format!(
                "handler_timeout ({}s) must be shorter than visibility_timeout ({}s)",
                self.handler_timeout.as_secs_f64(),
                self.visibility_timeout.as_secs_f64()
            )));
        }
        Ok(())
    }
}

/// Business logic run for each delivered event. Must be idempotent: a slow
/// success can still be redelivered once its visibility window closes.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, event: &Event, message: &QueueMessage) -> Result<(), String>;
}

/// Adapts an async closure over the event into a [`MessageHandler`].
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send,
{
    async fn handle(&self, event: &Event, _message: &QueueMessage) -> Result<(), String> {
        (self.0)(event.clone()).await
    }
}

/// Skips events whose id already completed successfully in this process.
/// Remembers at most `capacity` ids, oldest evicted first.
pub struct DeduplicatingHandler<H> {
    inner: H,
    capacity: usize,
    seen: Mutex<SeenIds>,
}

#[derive(Default)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl<H: MessageHandler> DeduplicatingHandler<H> {
    pub fn new(inner: H, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            seen: Mutex::new(SeenIds::default()),
        }
    }

    fn already_processed(&self, event_id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ids
            .contains(event_id)
    }

    fn remember(&self, event_id: &str) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if !seen.ids.insert(event_id.to_string()) {
            return;
        }
        seen.order.push_back(event_id.to_string());
        while seen.order.len() > self.capacity {
            if let Some(evicted) = seen.order.pop_front() {
                seen.ids.remove(&evicted);
            }
        }
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for DeduplicatingHandler<H> {
    async fn handle(&self, event: &Event, message: &QueueMessage) -> Result<(), String> {
        if self.already_processed(&event.id) {
            tracing::debug!(
                event_id = %event.id,
                message_id = %message.message_id,
                "skipping already processed event"
            );
            return Ok(());
        }
        self.inner.handle(event, message).await?;
        self.remember(&event.id);
        Ok(())
    }
}

/// Decodes and handles one message under the handler timeout. Does not
/// acknowledge; callers decide what success means for their transport.
pub async fn process_message(
    handler: &dyn MessageHandler,
    message: &QueueMessage,
    handler_timeout: Duration,
) -> Result<Event, RelayError> {
    let event = message.event()?;
    match tokio::time::timeout(handler_timeout, handler.handle(&event, message)).await {
        Ok(Ok(())) => Ok(event),
        Ok(Err(reason)) => Err(RelayError::processing(&message.message_id, reason)),
        Err(_) => Err(RelayError::processing(
            &message.message_id,
            format!("handler timed out after {}s", handler_timeout.as_secs_f64()),
        )),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub received: usize,
    pub acknowledged: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn absorb(&mut self, other: BatchReport) {
        self.received += other.received;
        self.acknowledged += other.acknowledged;
        self.failed += other.failed;
    }
}

pub struct ConsumerWorker {
    name: String,
    queue: Arc<dyn MessageQueue>,
    handler: Arc<dyn MessageHandler>,
    config: WorkerConfig,
}

impl ConsumerWorker {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn MessageQueue>,
        handler: Arc<dyn MessageHandler>,
        config: WorkerConfig,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            queue,
            handler,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One receive-process-acknowledge cycle. Each message runs in its own
    /// task so a failing or slow handler never holds up the others.
    pub async fn run_once(&self) -> Result<BatchReport, RelayError> {
        let messages = self
            .queue
            .receive(
                self.config.batch_size,
                self.config.visibility_timeout,
                self.config.wait_time,
            )
            .await?;

        let mut report = BatchReport {
            received: messages.len(),
            ..BatchReport::default()
        };

        let mut tasks = JoinSet::new();
        for message in messages {
            let queue = Arc::clone(&self.queue);
            let handler = Arc::clone(&self.handler);
            let handler_timeout = self.config.handler_timeout;
            let worker = self.name.clone();
            tasks.spawn(async move {
                tracing::debug!(
                    worker = %worker,
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "message received"
                );
                let event = process_message(handler.as_ref(), &message, handler_timeout).await?;
                match queue.acknowledge(&message.message_id).await? {
                    AckOutcome::Removed => tracing::info!(
                        worker = %worker,
                        message_id = %message.message_id,
                        event_id = %event.id,
                        "message acknowledged"
                    ),
                    AckOutcome::AlreadyRemoved => tracing::debug!(
                        worker = %worker,
                        message_id = %message.message_id,
                        "message was already acknowledged"
                    ),
                }
                Ok::<(), RelayError>(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => report.acknowledged += 1,
                Ok(Err(error)) => {
                    tracing::warn!(worker = %self.name, error = %error, "message processing failed");
                    report.failed += 1;
                }
                Err(join_error) => {
                    tracing::error!(worker = %self.name, error = %join_error, "message task aborted");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Loops until `shutdown` flips to true or its sender is dropped. The
    /// signal is checked between batches; messages still in flight when the
    /// worker stops become visible again after their timeout.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> BatchReport {
        tracing::info!(worker = %self.name, queue = %self.queue.name(), "worker started");
        let mut totals = BatchReport::default();

        while !should_stop(&shutdown) {
            match self.run_once().await {
                Ok(report) => totals.absorb(report),
                Err(error) => {
                    tracing::warn!(worker = %self.name, error = %error, "receive failed; backing off");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        tracing::info!(
            worker = %self.name,
            received = totals.received,
            acknowledged = totals.acknowledged,
            failed = totals.failed,
            "worker stopped"
        );
        totals
    }
}

fn should_stop(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Starts `workers` independent consumers over the same queue.
pub fn spawn_pool(
    queue: Arc<dyn MessageQueue>,
    handler: Arc<dyn MessageHandler>,
    config: WorkerConfig,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<BatchReport>>, RelayError> {
    let mut handles = Vec::with_capacity(workers);
    for index in 0..workers {
        let worker = ConsumerWorker::new(
            format!("worker-{index}"),
            Arc::clone(&queue),
            Arc::clone(&handler),
            config.clone(),
        )?;
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::clock::FakeClock;
    use crate::contract::Detail;
    use crate::queue::{InMemoryQueue, QueueDepth};

    fn config() -> WorkerConfig {
        WorkerConfig {
            batch_size: 10,
            visibility_timeout: Duration::from_secs(30),
            wait_time: Duration::ZERO,
            handler_timeout: Duration::from_millis(200),
            error_backoff: Duration::from_millis(10),
        }
    }

    fn order_event(order_id: &str) -> Event {
        let mut detail = Detail::new();
        detail.insert("orderId".to_string(), json!(order_id));
        Event::new("myapp", "order", detail, Utc::now())
    }

    fn order_id(event: &Event) -> String {
        event.detail["orderId"].as_str().unwrap_or_default().to_string()
    }

    /// Fails every order whose id starts with "bad".
    struct SelectiveHandler {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for SelectiveHandler {
        async fn handle(&self, event: &Event, _message: &QueueMessage) -> Result<(), String> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if order_id(event).starts_with("bad") {
                return Err("rejected order".to_string());
            }
            Ok(())
        }
    }

    fn in_memory(max_receive_count: u32) -> (Arc<InMemoryQueue<FakeClock>>, FakeClock) {
        let clock = FakeClock::default();
        (
            Arc::new(InMemoryQueue::with_clock("orders", max_receive_count, clock.clone())),
            clock,
        )
    }

    #[test]
    fn config_rejects_handler_timeout_not_below_visibility() {
        let config = WorkerConfig {
            handler_timeout: Duration::from_secs(30),
            ..config()
        };
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn config_rejects_out_of_range_batch_size() {
        for batch_size in [0, MAX_BATCH_SIZE + 1] {
            let config = WorkerConfig {
                batch_size,
                ..config()
            };
            assert!(config.validate().is_err());
        }
    }

    #[tokio::test]
    async fn acknowledges_successes_and_leaves_failures_for_retry() {
        let (queue, clock) = in_memory(5);
        for order in ["A1", "bad-1", "A2"] {
            queue.enqueue(&order_event(order)).await.expect("enqueue");
        }
        let handler = Arc::new(SelectiveHandler {
            handled: AtomicUsize::new(0),
        });
        let worker = ConsumerWorker::new("w", queue.clone(), handler.clone(), config())
            .expect("worker should build");

        let report = worker.run_once().await.expect("batch should run");
        assert_eq!(
            report,
            BatchReport {
                received: 3,
                acknowledged: 2,
                failed: 1
            }
        );
        assert_eq!(queue.depth(), QueueDepth { visible: 0, in_flight: 1, dead_lettered: 0 });

        clock.advance(Duration::from_secs(30));
        let retry = worker.run_once().await.expect("batch should run");
        assert_eq!(retry.received, 1);
        assert_eq!(retry.failed, 1);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn persistent_failure_ends_in_dead_letter() {
        let (queue, clock) = in_memory(3);
        queue.enqueue(&order_event("bad-2")).await.expect("enqueue");
        let worker = ConsumerWorker::new(
            "w",
            queue.clone(),
            Arc::new(SelectiveHandler {
                handled: AtomicUsize::new(0),
            }),
            config(),
        )
        .expect("worker should build");

        for _ in 0..3 {
            assert_eq!(worker.run_once().await.expect("batch").failed, 1);
            clock.advance(Duration::from_secs(30));
        }
        assert_eq!(worker.run_once().await.expect("batch").received, 0);
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.dead_letters()[0].message.receive_count, 3);
    }

    #[tokio::test]
    async fn handler_timeout_counts_as_failure() {
        let (queue, _clock) = in_memory(5);
        queue.enqueue(&order_event("slow")).await.expect("enqueue");
        let handler = HandlerFn(|_event: Event| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), String>(())
        });
        let worker = ConsumerWorker::new("w", queue.clone(), Arc::new(handler), config())
            .expect("worker should build");

        let report = worker.run_once().await.expect("batch should run");
        assert_eq!(report.failed, 1);
        assert_eq!(queue.depth().in_flight, 1);
    }

    #[tokio::test]
    async fn receive_failure_is_reported_not_fatal() {
        let (queue, _clock) = in_memory(5);
        queue.set_unavailable(true);
        let worker = ConsumerWorker::new(
            "w",
            queue.clone(),
            Arc::new(HandlerFn(|_event: Event| async { Ok::<(), String>(()) })),
            config(),
        )
        .expect("worker should build");

        assert!(matches!(
            worker.run_once().await,
            Err(RelayError::DeliveryFailure { .. })
        ));
    }

    #[tokio::test]
    async fn deduplicating_handler_runs_inner_once_per_event() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let handler = DeduplicatingHandler::new(
            HandlerFn(move |_event: Event| {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                }
            }),
            16,
        );
        let event = order_event("A1");
        let message = QueueMessage::new(&event, Utc::now()).expect("message");

        handler.handle(&event, &message).await.expect("first");
        handler.handle(&event, &message).await.expect("duplicate");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deduplicating_handler_evicts_oldest_ids() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let handler = DeduplicatingHandler::new(
            HandlerFn(move |_event: Event| {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                }
            }),
            1,
        );
        let first = order_event("A1");
        let second = order_event("A2");
        let message = QueueMessage::new(&first, Utc::now()).expect("message");

        handler.handle(&first, &message).await.expect("first");
        handler.handle(&second, &message).await.expect("second");
        handler.handle(&first, &message).await.expect("first again");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_drains_queue_and_stops_on_shutdown() {
        let queue = Arc::new(InMemoryQueue::new("orders", 5));
        for index in 0..20 {
            queue
                .enqueue(&order_event(&format!("A{index}")))
                .await
                .expect("enqueue");
        }
        let processed = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&processed);
        let handler = HandlerFn(move |_event: Event| {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = WorkerConfig {
            wait_time: Duration::from_millis(20),
            ..config()
        };

        let handles = spawn_pool(queue.clone(), Arc::new(handler), config, 3, shutdown_rx)
            .expect("pool should start");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.depth() != QueueDepth::default() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).expect("workers are listening");

        let mut totals = BatchReport::default();
        for handle in handles {
            totals.absorb(handle.await.expect("worker task"));
        }
        assert_eq!(totals.acknowledged, 20);
        assert_eq!(processed.load(Ordering::SeqCst), 20);
        assert_eq!(queue.depth(), QueueDepth::default());
    }
}
