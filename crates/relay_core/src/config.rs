//! Environment-driven relay configuration, read once at startup.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Number, Value};

use crate::error::RelayError;
use crate::ingress::{IngressDefaults, IngressSettings, DEFAULT_EVENT_SOURCE, DEFAULT_EVENT_TYPE};
use crate::routing::RoutingTable;
use crate::worker::{WorkerConfig, DEFAULT_ERROR_BACKOFF};

pub const QUEUE_NAME_VAR: &str = "RELAY_QUEUE_NAME";
pub const QUEUE_URL_VAR: &str = "RELAY_QUEUE_URL";
pub const QUEUE_URLS_VAR: &str = "RELAY_QUEUE_URLS";
pub const DEAD_LETTER_QUEUE_URL_VAR: &str = "RELAY_DEAD_LETTER_QUEUE_URL";
pub const VISIBILITY_TIMEOUT_VAR: &str = "RELAY_VISIBILITY_TIMEOUT_SECS";
pub const MAX_RECEIVE_COUNT_VAR: &str = "RELAY_MAX_RECEIVE_COUNT";
pub const RECEIVE_WAIT_VAR: &str = "RELAY_RECEIVE_WAIT_SECS";
pub const BATCH_SIZE_VAR: &str = "RELAY_BATCH_SIZE";
pub const HANDLER_TIMEOUT_VAR: &str = "RELAY_HANDLER_TIMEOUT_SECS";
pub const ROUTING_RULES_VAR: &str = "RELAY_ROUTING_RULES";
pub const ARCHIVE_BUCKET_VAR: &str = "RELAY_ARCHIVE_BUCKET";
pub const EVENT_SOURCE_VAR: &str = "INGRESS_EVENT_SOURCE";
pub const EVENT_TYPE_VAR: &str = "INGRESS_EVENT_TYPE";
pub const DEFAULT_ORDER_ID_VAR: &str = "INGRESS_DEFAULT_ORDER_ID";
pub const DEFAULT_AMOUNT_VAR: &str = "INGRESS_DEFAULT_AMOUNT";

pub const DEFAULT_QUEUE_NAME: &str = "EventBridgeQueue";
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub name: String,
    pub url: Option<String>,
    /// Additional queue name → URL bindings for rules that target other queues.
    pub extra_urls: BTreeMap<String, String>,
    pub max_receive_count: u32,
    /// Where consumers move messages past `max_receive_count`.
    pub dead_letter_url: Option<String>,
}

impl QueueSettings {
    pub fn url_for(&self, name: &str) -> Option<&str> {
        if name == self.name {
            if let Some(url) = self.url.as_deref() {
                return Some(url);
            }
        }
        self.extra_urls.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub queue: QueueSettings,
    pub worker: WorkerConfig,
    pub ingress: IngressSettings,
    pub routing: RoutingTable,
    pub archive_bucket: Option<String>,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; blank values count as
    /// unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RelayError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let queue_name = get(QUEUE_NAME_VAR).unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string());
        let extra_urls = match get(QUEUE_URLS_VAR) {
            Some(text) => serde_json::from_str(&text).map_err(|error| {
                RelayError::Config(format!("{QUEUE_URLS_VAR} must be a JSON object of strings: {error}"))
            })?,
            None => BTreeMap::new(),
        };
        let max_receive_count =
            parse_number(get(MAX_RECEIVE_COUNT_VAR), MAX_RECEIVE_COUNT_VAR, DEFAULT_MAX_RECEIVE_COUNT)?;
        if max_receive_count == 0 {
            return Err(RelayError::Config(format!(
                "{MAX_RECEIVE_COUNT_VAR} must be a positive integer"
            )));
        }

        let worker_defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            batch_size: parse_number(get(BATCH_SIZE_VAR), BATCH_SIZE_VAR, worker_defaults.batch_size)?,
            visibility_timeout: parse_secs(
                get(VISIBILITY_TIMEOUT_VAR),
                VISIBILITY_TIMEOUT_VAR,
                worker_defaults.visibility_timeout,
            )?,
            wait_time: parse_secs(get(RECEIVE_WAIT_VAR), RECEIVE_WAIT_VAR, worker_defaults.wait_time)?,
            handler_timeout: parse_secs(
                get(HANDLER_TIMEOUT_VAR),
                HANDLER_TIMEOUT_VAR,
                worker_defaults.handler_timeout,
            )?,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        };
        worker.validate()?;

        let source = get(EVENT_SOURCE_VAR).unwrap_or_else(|| DEFAULT_EVENT_SOURCE.to_string());
        let detail_type = get(EVENT_TYPE_VAR).unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string());
        let builtin = IngressDefaults::default();
        let defaults = IngressDefaults {
            order_id: get(DEFAULT_ORDER_ID_VAR).unwrap_or(builtin.order_id),
            amount: match get(DEFAULT_AMOUNT_VAR) {
                Some(text) => parse_amount(&text)?,
                None => builtin.amount,
            },
        };

        let routing = match get(ROUTING_RULES_VAR) {
            Some(text) => RoutingTable::from_json(&text)?,
            None => RoutingTable::single_queue(source.clone(), detail_type.clone(), queue_name.clone()),
        };

        Ok(Self {
            queue: QueueSettings {
                name: queue_name,
                url: get(QUEUE_URL_VAR),
                extra_urls,
                max_receive_count,
                dead_letter_url: get(DEAD_LETTER_QUEUE_URL_VAR),
            },
            worker,
            ingress: IngressSettings {
                source,
                detail_type,
                defaults,
            },
            routing,
            archive_bucket: get(ARCHIVE_BUCKET_VAR),
        })
    }
}

fn parse_number<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, RelayError> {
    match value {
        Some(text) => text
            .parse()
            .map_err(|_| RelayError::Config(format!("{key} must be a non-negative integer, got '{text}'"))),
        None => Ok(default),
    }
}

fn parse_secs(value: Option<String>, key: &str, default: Duration) -> Result<Duration, RelayError> {
    match value {
        Some(text) => parse_number(Some(text), key, 0u64).map(Duration::from_secs),
        None => Ok(default),
    }
}

fn parse_amount(text: &str) -> Result<Number, RelayError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Number(number)) => Ok(number),
        _ => Err(RelayError::Config(format!(
            "{DEFAULT_AMOUNT_VAR} must be a JSON number, got '{text}'"
        ))),
    }
}
