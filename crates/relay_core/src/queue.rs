//! Durable queue contract with visibility-timeout redelivery.
//!
//! A received message stays hidden from other consumers until its visibility
//! window closes. If it is not acknowledged by then it becomes receivable
//! again, and once a delivery would push its receive count past the
//! configured threshold it is moved to the dead-letter sink instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::clock::{add_duration, Clock, SystemClock};
use crate::contract::{body_digest, Event};
use crate::error::RelayError;
use crate::routing::EventSink;

/// Upper bound on how long a waiting `receive` sleeps before re-checking for
/// messages whose visibility window has closed.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    pub body_digest: String,
    pub receive_count: u32,
    pub visible_after: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(event: &Event, now: DateTime<Utc>) -> Result<Self, RelayError> {
        let body = event.to_body()?;
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            body_digest: body_digest(&body),
            body,
            receive_count: 0,
            visible_after: now,
            sent_at: now,
        })
    }

    /// Decodes the event after checking the body against its digest.
    pub fn event(&self) -> Result<Event, RelayError> {
        if body_digest(&self.body) != self.body_digest {
            return Err(RelayError::processing(
                &self.message_id,
                "body does not match its digest",
            ));
        }
        Event::from_body(&self.body)
            .map_err(|error| RelayError::processing(&self.message_id, error.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Removed,
    /// Already acknowledged, dead-lettered or never enqueued. Not an error.
    AlreadyRemoved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub message: QueueMessage,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub visible: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn enqueue(&self, event: &Event) -> Result<String, RelayError>;

    /// Returns up to `max_messages` visible messages, hiding each for
    /// `visibility_timeout`. Waits at most `wait` for messages to arrive.
    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, RelayError>;

    /// Removes the message. Acknowledgment is keyed by message id, not by
    /// delivery: a late ack from a consumer whose visibility window already
    /// expired still removes a message another consumer may be processing.
    async fn acknowledge(&self, message_id: &str) -> Result<AckOutcome, RelayError>;

    async fn extend_visibility(&self, message_id: &str, timeout: Duration)
        -> Result<(), RelayError>;
}

/// Whether a delivery numbered `delivery_count` (1 for the first) goes past
/// the dead-letter threshold. Such a delivery must not reach a handler.
pub fn exceeds_receive_limit(delivery_count: u32, max_receive_count: u32) -> bool {
    delivery_count > max_receive_count
}

/// Destination for messages that went past the dead-letter threshold on a
/// queue that does not keep its own dead letters. Returns a receipt for the
/// dead-lettered copy.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<String, RelayError>;
}

pub fn dead_letter_reason(max_receive_count: u32) -> String {
    format!("receive count exceeded max_receive_count={max_receive_count}")
}

/// Routes events into a queue.
pub struct QueueSink {
    queue: Arc<dyn MessageQueue>,
}

impl QueueSink {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl EventSink for QueueSink {
    async fn deliver(&self, event: &Event) -> Result<String, RelayError> {
        self.queue.enqueue(event).await
    }
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<QueueMessage>,
    dead_letters: Vec<DeadLetter>,
}

/// Process-local queue store. All operations are serialized behind one lock
/// that is never held across an await point.
pub struct InMemoryQueue<C: Clock = SystemClock> {
    name: String,
    max_receive_count: u32,
    clock: C,
    state: Mutex<QueueState>,
    available: Notify,
    unavailable: AtomicBool,
}

impl InMemoryQueue<SystemClock> {
    pub fn new(name: impl Into<String>, max_receive_count: u32) -> Self {
        Self::with_clock(name, max_receive_count, SystemClock)
    }
}

impl<C: Clock> InMemoryQueue<C> {
    pub fn with_clock(name: impl Into<String>, max_receive_count: u32, clock: C) -> Self {
        Self {
            name: name.into(),
            max_receive_count: max_receive_count.max(1),
            clock,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn max_receive_count(&self) -> u32 {
        self.max_receive_count
    }

    /// Failure injection: while set, every operation fails as if the backing
    /// store were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn depth(&self) -> QueueDepth {
        let now = self.clock.now();
        let state = self.lock();
        let in_flight = state
            .messages
            .iter()
            .filter(|message| message.visible_after > now)
            .count();
        QueueDepth {
            visible: state.messages.len() - in_flight,
            in_flight,
            dead_lettered: state.dead_letters.len(),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    /// Moves every dead-lettered message back onto the queue with a fresh
    /// receive count. Returns how many were moved.
    pub fn redrive_dead_letters(&self) -> usize {
        let now = self.clock.now();
        let moved = {
            let mut state = self.lock();
            let dead_letters = std::mem::take(&mut state.dead_letters);
            let moved = dead_letters.len();
            for dead_letter in dead_letters {
                let mut message = dead_letter.message;
                message.receive_count = 0;
                message.visible_after = now;
                state.messages.push_back(message);
            }
            moved
        };
        if moved > 0 {
            tracing::info!(queue = %self.name, moved, "dead letters redriven");
            self.available.notify_waiters();
        }
        moved
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), RelayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RelayError::delivery(
                format!("queue:{}", self.name),
                "queue store unavailable",
            ));
        }
        Ok(())
    }

    fn take_visible(&self, max_messages: usize, visibility_timeout: Duration) -> Vec<QueueMessage> {
        let now = self.clock.now();
        let hidden_until = add_duration(now, visibility_timeout);
        let mut state = self.lock();
        let mut batch = Vec::new();
        let mut index = 0;

        while index < state.messages.len() && batch.len() < max_messages {
            if state.messages[index].visible_after > now {
                index += 1;
                continue;
            }

            let delivery_count = state.messages[index].receive_count.saturating_add(1);
            if exceeds_receive_limit(delivery_count, self.max_receive_count) {
                if let Some(message) = state.messages.remove(index) {
                    tracing::warn!(
                        queue = %self.name,
                        message_id = %message.message_id,
                        receive_count = message.receive_count,
                        "message dead-lettered"
                    );
                    state.dead_letters.push(DeadLetter {
                        reason: dead_letter_reason(self.max_receive_count),
                        message,
                        dead_lettered_at: now,
                    });
                }
                continue;
            }

            let message = &mut state.messages[index];
            message.receive_count += 1;
            message.visible_after = hidden_until;
            batch.push(message.clone());
            index += 1;
        }

        batch
    }
}

#[async_trait]
impl<C: Clock> MessageQueue for InMemoryQueue<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, event: &Event) -> Result<String, RelayError> {
        self.check_available()?;
        let message = QueueMessage::new(event, self.clock.now())?;
        let message_id = message.message_id.clone();
        self.lock().messages.push_back(message);
        self.available.notify_waiters();
        tracing::debug!(queue = %self.name, message_id = %message_id, event_id = %event.id, "message enqueued");
        Ok(message_id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, RelayError> {
        self.check_available()?;
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_visible(max_messages, visibility_timeout);
            if !batch.is_empty() || max_messages == 0 {
                return Ok(batch);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            let _ = tokio::time::timeout((deadline - now).min(POLL_INTERVAL), notified).await;
        }
    }

    async fn acknowledge(&self, message_id: &str) -> Result<AckOutcome, RelayError> {
        self.check_available()?;
        let mut state = self.lock();
        let Some(position) = state
            .messages
            .iter()
            .position(|message| message.message_id == message_id)
        else {
            tracing::debug!(queue = %self.name, message_id, "duplicate acknowledgment ignored");
            return Ok(AckOutcome::AlreadyRemoved);
        };
        state.messages.remove(position);
        Ok(AckOutcome::Removed)
    }

    async fn extend_visibility(
        &self,
        message_id: &str,
        timeout: Duration,
    ) -> Result<(), RelayError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.lock();
        let message = state
            .messages
            .iter_mut()
            .find(|message| message.message_id == message_id && message.visible_after > now)
            .ok_or_else(|| RelayError::UnknownMessage(message_id.to_string()))?;
        message.visible_after = add_duration(now, timeout);
        Ok(())
    }
}
