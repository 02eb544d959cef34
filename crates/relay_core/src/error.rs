use thiserror::Error;

/// Failure kinds surfaced by the relay. Each one is scoped to a single event
/// or message; none of them is fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The inbound request could not be turned into an event. Not retried.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Rules matched but none of their destinations accepted the event.
    #[error("no destination reachable for event {event_id}: {reason}")]
    RoutingFailure { event_id: String, reason: String },

    /// A destination or queue store was unavailable. Callers may retry.
    #[error("delivery to {destination} failed: {reason}")]
    DeliveryFailure { destination: String, reason: String },

    /// The consumer handler failed; the message will be redelivered.
    #[error("processing failed for message {message_id}: {reason}")]
    ProcessingFailure { message_id: String, reason: String },

    /// The message is unknown or not currently in flight.
    #[error("message {0} is not in flight")]
    UnknownMessage(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    pub fn delivery(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeliveryFailure {
            destination: destination.into(),
            reason: reason.into(),
        }
    }

    pub fn processing(message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProcessingFailure {
            message_id: message_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RoutingFailure { .. } | Self::DeliveryFailure { .. } | Self::ProcessingFailure { .. }
        )
    }
}
