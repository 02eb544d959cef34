//! Static rule table and the router that fans events out to destinations.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::contract::Event;
use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// Durable queue, by name.
    Queue { name: String },
    /// Object-store archive of the event JSON under a key prefix.
    Archive { prefix: String },
    /// Asynchronous function invocation.
    Function { name: String },
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue { name: name.into() }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue { name } => write!(f, "queue:{name}"),
            Self::Archive { prefix } => write!(f, "archive:{prefix}"),
            Self::Function { name } => write!(f, "function:{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    pub source: BTreeSet<String>,
    pub detail_type: BTreeSet<String>,
    pub targets: Vec<Destination>,
}

impl RoutingRule {
    pub fn matches(&self, event: &Event) -> bool {
        self.source.contains(&event.source) && self.detail_type.contains(&event.detail_type)
    }
}

/// Validated, immutable rule set. Loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
}

impl RoutingTable {
    pub fn new(rules: Vec<RoutingRule>) -> Result<Self, RelayError> {
        let mut names = BTreeSet::new();
        for rule in &rules {
            if rule.name.trim().is_empty() {
                return Err(RelayError::Config("rule names must be non-empty".to_string()));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
            if rule.source.is_empty() || rule.detail_type.is_empty() {
                return Err(RelayError::Config(format!(
                    "rule '{}' must list at least one source and one detail_type",
                    rule.name
                )));
            }
            if rule.targets.is_empty() {
                return Err(RelayError::Config(format!(
                    "rule '{}' must have at least one target",
                    rule.name
                )));
            }
        }
        Ok(Self { rules })
    }

    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        let rules: Vec<RoutingRule> = serde_json::from_str(text)
            .map_err(|error| RelayError::Config(format!("invalid routing rules: {error}")))?;
        Self::new(rules)
    }

    /// Single rule forwarding `source`/`detail_type` events to one queue.
    pub fn single_queue(
        source: impl Into<String>,
        detail_type: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            rules: vec![RoutingRule {
                name: "default".to_string(),
                source: BTreeSet::from([source.into()]),
                detail_type: BTreeSet::from([detail_type.into()]),
                targets: vec![Destination::queue(queue_name)],
            }],
        }
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn matching<'a>(&'a self, event: &'a Event) -> impl Iterator<Item = &'a RoutingRule> + 'a {
        self.rules.iter().filter(move |rule| rule.matches(event))
    }

    pub fn destinations(&self) -> BTreeSet<&Destination> {
        self.rules.iter().flat_map(|rule| rule.targets.iter()).collect()
    }
}

/// Something the router can hand an event to. Returns a receipt identifying
/// the delivery (message id, object key, request id).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &Event) -> Result<String, RelayError>;
}

pub type SinkMap = HashMap<Destination, Arc<dyn EventSink>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub rule: String,
    pub destination: String,
    pub receipt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteReport {
    pub event_id: String,
    pub matched_rules: Vec<String>,
    pub deliveries: Vec<Delivery>,
}

pub struct Router {
    table: RoutingTable,
    sinks: SinkMap,
}

impl Router {
    /// Binds every destination named by the table to a sink. A destination
    /// without a sink is a startup error rather than a runtime drop.
    pub fn new(table: RoutingTable, sinks: SinkMap) -> Result<Self, RelayError> {
        for destination in table.destinations() {
            if !sinks.contains_key(destination) {
                return Err(RelayError::Config(format!(
                    "no sink registered for destination {destination}"
                )));
            }
        }
        Ok(Self { table, sinks })
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Forwards the event to every target of every matching rule. All
    /// deliveries are attempted before any failure is reported.
    pub async fn route(&self, event: &Event) -> Result<RouteReport, RelayError> {
        let mut report = RouteReport {
            event_id: event.id.clone(),
            ..RouteReport::default()
        };
        let mut failures: Vec<(String, RelayError)> = Vec::new();

        for rule in self.table.matching(event) {
            tracing::debug!(event_id = %event.id, rule = %rule.name, "rule matched");
            report.matched_rules.push(rule.name.clone());

            for destination in &rule.targets {
                let Some(sink) = self.sinks.get(destination) else {
                    failures.push((
                        destination.to_string(),
                        RelayError::delivery(destination.to_string(), "no sink registered"),
                    ));
                    continue;
                };

                match sink.deliver(event).await {
                    Ok(receipt) => {
                        tracing::info!(
                            event_id = %event.id,
                            rule = %rule.name,
                            destination = %destination,
                            receipt = %receipt,
                            "event delivered"
                        );
                        report.deliveries.push(Delivery {
                            rule: rule.name.clone(),
                            destination: destination.to_string(),
                            receipt,
                        });
                    }
                    Err(error) => {
                        tracing::warn!(
                            event_id = %event.id,
                            rule = %rule.name,
                            destination = %destination,
                            error = %error,
                            "event delivery failed"
                        );
                        failures.push((destination.to_string(), error));
                    }
                }
            }
        }

        if report.matched_rules.is_empty() {
            tracing::info!(
                event_id = %event.id,
                source = %event.source,
                detail_type = %event.detail_type,
                "no rule matched event"
            );
            return Ok(report);
        }

        let Some((first_destination, first_error)) = failures.first() else {
            return Ok(report);
        };

        if report.deliveries.is_empty() {
            return Err(RelayError::RoutingFailure {
                event_id: event.id.clone(),
                reason: format!("all {} deliveries failed; first: {first_error}", failures.len()),
            });
        }

        Err(RelayError::delivery(
            first_destination.clone(),
            format!(
                "{} of {} deliveries failed: {first_error}",
                failures.len(),
                failures.len() + report.deliveries.len()
            ),
        ))
    }
}
