use chrono::Utc;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use relay_core::config::RelayConfig;
use relay_core::ingress::IngressSettings;
use relay_core::routing::Router;
use relay_lambda::adapters::aws::AwsClients;
use relay_lambda::handlers::ingress::{handle_ingress_event, ApiGatewayResponse};
use relay_lambda::telemetry::init_tracing;
use serde_json::Value;

struct IngressDependencies {
    settings: IngressSettings,
    router: Router,
}

async fn handle_request(
    event: LambdaEvent<Value>,
    deps: &IngressDependencies,
) -> Result<ApiGatewayResponse, Error> {
    Ok(handle_ingress_event(event.payload, &deps.settings, &deps.router, Utc::now()).await)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let config = RelayConfig::from_env()?;
    let clients = AwsClients::from_env().await;
    let deps = IngressDependencies {
        router: clients.router(&config)?,
        settings: config.ingress,
    };
    tracing::info!(rules = deps.router.table().rules().len(), "ingress ready");

    lambda_runtime::run(service_fn(|event| handle_request(event, &deps))).await
}
