use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::RelayError;
use crate::routing::RouteReport;

pub const ACCEPTED_MESSAGE: &str = "Event sent successfully";
pub const REJECTED_MESSAGE: &str = "Error sending event";

pub type Detail = Map<String, Value>;

/// Canonical routed event. Created once at ingress and never modified; every
/// hop after that works on a shared reference or on its JSON body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub source: String,
    #[serde(rename = "detail-type", alias = "type")]
    pub detail_type: String,
    pub detail: Detail,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        source: impl Into<String>,
        detail_type: impl Into<String>,
        detail: Detail,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            detail_type: detail_type.into(),
            detail,
            timestamp,
        }
    }

    pub fn to_body(&self) -> Result<String, RelayError> {
        serde_json::to_string(self)
            .map_err(|error| RelayError::MalformedInput(format!("event is not serializable: {error}")))
    }

    pub fn from_body(body: &str) -> Result<Self, RelayError> {
        serde_json::from_str(body)
            .map_err(|error| RelayError::MalformedInput(format!("invalid event body: {error}")))
    }
}

/// ISO-8601 with millisecond precision, the format stamped into event details.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Hex SHA-256 of a message body, recorded on enqueue and checked by consumers.
pub fn body_digest(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngressAccepted {
    pub message: String,
    pub event: Detail,
    pub routing: RouteReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngressRejected {
    pub message: String,
    pub error: String,
}

impl IngressRejected {
    pub fn from_error(error: &RelayError) -> Self {
        Self {
            message: REJECTED_MESSAGE.to_string(),
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchItemFailure {
    #[serde(rename = "itemIdentifier")]
    pub item_identifier: String,
}

/// Partial-batch response understood by queue-triggered functions: only the
/// listed records are returned to the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchResponse {
    #[serde(rename = "batchItemFailures")]
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl BatchResponse {
    pub fn fail(&mut self, message_id: impl Into<String>) {
        self.batch_item_failures.push(BatchItemFailure {
            item_identifier: message_id.into(),
        });
    }
}
