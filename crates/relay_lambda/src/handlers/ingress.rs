use chrono::{DateTime, Utc};
use relay_core::contract::{IngressAccepted, IngressRejected, ACCEPTED_MESSAGE};
use relay_core::ingress::{build_event, IngressSettings};
use relay_core::routing::Router;
use relay_core::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiGatewayResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: Value,
    pub body: String,
}

/// Accepts an HTTP request (API Gateway proxy or function URL event), builds
/// the canonical event and hands it to the router. Failures are reported as
/// a 500 and never retried here; the caller owns the retry.
pub async fn handle_ingress_event(
    event: Value,
    settings: &IngressSettings,
    router: &Router,
    now: DateTime<Utc>,
) -> ApiGatewayResponse {
    let relay_event = match extract_body(&event)
        .and_then(|body| build_event(body.as_ref(), settings, now))
    {
        Ok(value) => value,
        Err(error) => return rejected(&error),
    };

    match router.route(&relay_event).await {
        Ok(routing) => {
            tracing::info!(
                event_id = %relay_event.id,
                source = %relay_event.source,
                detail_type = %relay_event.detail_type,
                deliveries = routing.deliveries.len(),
                "event accepted"
            );
            accepted(IngressAccepted {
                message: ACCEPTED_MESSAGE.to_string(),
                event: relay_event.detail,
                routing,
            })
        }
        Err(error) => rejected(&error),
    }
}

/// Pulls the request body out of an HTTP event. A payload without HTTP
/// framing (direct invocation) is treated as the body itself.
fn extract_body(event: &Value) -> Result<Option<Value>, RelayError> {
    let Some(object) = event.as_object() else {
        return Err(RelayError::MalformedInput(
            "request payload must be a JSON object".to_string(),
        ));
    };

    if object
        .get("isBase64Encoded")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Err(RelayError::MalformedInput(
            "base64-encoded bodies are not supported; send application/json".to_string(),
        ));
    }

    match object.get("body") {
        Some(body) => Ok(Some(body.clone())),
        None if object.contains_key("requestContext") => Ok(None),
        None => Ok(Some(event.clone())),
    }
}

fn accepted(payload: IngressAccepted) -> ApiGatewayResponse {
    match serde_json::to_string(&payload) {
        Ok(body) => response(200, body),
        Err(error) => rejected(&RelayError::MalformedInput(format!(
            "response is not serializable: {error}"
        ))),
    }
}

fn rejected(error: &RelayError) -> ApiGatewayResponse {
    tracing::error!(error = %error, retryable = error.is_retryable(), "error sending event");
    response(500, json!(IngressRejected::from_error(error)).to_string())
}

fn response(status_code: u16, body: String) -> ApiGatewayResponse {
    ApiGatewayResponse {
        status_code,
        headers: json!({"Content-Type": "application/json"}),
        body,
    }
}
