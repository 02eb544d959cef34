//! Runs ingress, routing and a consumer pool in one process against
//! in-memory queues, then prints a JSON summary of what happened.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use relay_core::config::RelayConfig;
use relay_core::contract::Event;
use relay_core::ingress::ORDER_ID_KEY;
use relay_core::queue::{InMemoryQueue, MessageQueue, QueueMessage, QueueSink};
use relay_core::routing::{Destination, EventSink, Router, SinkMap};
use relay_core::worker::{spawn_pool, BatchReport, MessageHandler};
use relay_core::RelayError;
use relay_lambda::handlers::consumer::LogEventHandler;
use relay_lambda::handlers::ingress::handle_ingress_event;
use relay_lambda::telemetry::init_tracing;
use serde_json::{json, Value};
use tokio::sync::watch;

#[derive(Parser)]
#[command(
    name = "relay_local",
    about = "Post events through the relay against in-memory queues"
)]
struct Cli {
    /// Request body to post; repeat for several events
    #[arg(long = "body")]
    bodies: Vec<String>,
    /// Consumers per queue
    #[arg(long, default_value_t = 2)]
    workers: usize,
    /// Order ids whose processing always fails
    #[arg(long = "fail-order")]
    fail_orders: Vec<String>,
    /// Visibility timeout applied to received messages
    #[arg(long, default_value_t = 2)]
    visibility_secs: u64,
    /// Per-message handler timeout, must be shorter than the visibility timeout
    #[arg(long, default_value_t = 500)]
    handler_timeout_ms: u64,
    /// Long-poll wait per receive
    #[arg(long, default_value_t = 100)]
    wait_ms: u64,
    /// Give up waiting for the queues to drain after this long
    #[arg(long, default_value_t = 30)]
    drain_timeout_secs: u64,
}

/// Logs every event but fails the configured order ids, so redelivery and
/// dead-lettering can be observed locally.
struct FailingOrders {
    inner: LogEventHandler,
    order_ids: BTreeSet<String>,
}

#[async_trait]
impl MessageHandler for FailingOrders {
    async fn handle(&self, event: &Event, message: &QueueMessage) -> Result<(), String> {
        let order_id = event
            .detail
            .get(ORDER_ID_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default();
        if self.order_ids.contains(order_id) {
            return Err(format!("order {order_id} is configured to fail"));
        }
        self.inner.handle(event, message).await
    }
}

fn local_queues(
    config: &RelayConfig,
) -> Result<(Router, Vec<Arc<InMemoryQueue>>), RelayError> {
    let mut sinks = SinkMap::new();
    let mut queues = Vec::new();
    for destination in config.routing.destinations() {
        let Destination::Queue { name } = destination else {
            return Err(RelayError::Config(format!(
                "relay_local only supports queue destinations, found {destination}"
            )));
        };
        let queue = Arc::new(InMemoryQueue::new(
            name.clone(),
            config.queue.max_receive_count,
        ));
        let sink: Arc<dyn EventSink> = Arc::new(QueueSink::new(queue.clone()));
        sinks.insert(destination.clone(), sink);
        queues.push(queue);
    }
    Ok((Router::new(config.routing.clone(), sinks)?, queues))
}

fn drained(queues: &[Arc<InMemoryQueue>]) -> bool {
    queues.iter().all(|queue| {
        let depth = queue.depth();
        depth.visible == 0 && depth.in_flight == 0
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = RelayConfig::from_env()?;
    config.worker.visibility_timeout = Duration::from_secs(cli.visibility_secs);
    config.worker.handler_timeout = Duration::from_millis(cli.handler_timeout_ms);
    config.worker.wait_time = Duration::from_millis(cli.wait_ms);
    config.worker.validate()?;

    let (router, queues) = local_queues(&config)?;
    let handler: Arc<dyn MessageHandler> = Arc::new(FailingOrders {
        inner: LogEventHandler,
        order_ids: cli.fail_orders.iter().cloned().collect(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for queue in &queues {
        let queue: Arc<dyn MessageQueue> = queue.clone();
        handles.extend(spawn_pool(
            queue,
            Arc::clone(&handler),
            config.worker.clone(),
            cli.workers.max(1),
            shutdown_rx.clone(),
        )?);
    }

    let bodies = if cli.bodies.is_empty() {
        vec![String::new()]
    } else {
        cli.bodies.clone()
    };
    let mut responses = Vec::with_capacity(bodies.len());
    for body in bodies {
        let response = handle_ingress_event(
            json!({ "requestContext": {}, "body": body }),
            &config.ingress,
            &router,
            Utc::now(),
        )
        .await;
        let parsed: Value = serde_json::from_str(&response.body)?;
        responses.push(json!({ "statusCode": response.status_code, "body": parsed }));
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(cli.drain_timeout_secs);
    while !drained(&queues) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if !drained(&queues) {
        tracing::warn!("queues did not drain before the deadline");
    }

    shutdown_tx.send_replace(true);
    let mut totals = BatchReport::default();
    for handle in handles {
        totals.absorb(handle.await?);
    }

    let queue_reports: Vec<Value> = queues
        .iter()
        .map(|queue| {
            let dead_letters: Vec<Value> = queue
                .dead_letters()
                .into_iter()
                .map(|dead_letter| {
                    json!({
                        "messageId": dead_letter.message.message_id,
                        "receiveCount": dead_letter.message.receive_count,
                        "reason": dead_letter.reason,
                    })
                })
                .collect();
            json!({
                "name": queue.name(),
                "depth": queue.depth(),
                "deadLetters": dead_letters,
            })
        })
        .collect();

    let summary = json!({
        "responses": responses,
        "queues": queue_reports,
        "workers": totals,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
