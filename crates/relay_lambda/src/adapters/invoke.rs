use async_trait::async_trait;
use relay_core::contract::Event;
use relay_core::routing::{Destination, EventSink};
use relay_core::RelayError;

#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    /// Fire-and-forget invocation; returns an identifier for the accepted call.
    async fn invoke_async(&self, function_name: &str, payload: &[u8]) -> Result<String, String>;
}

/// Forwards each routed event, JSON-encoded, to a function.
pub struct FunctionSink<I> {
    invoker: I,
    function_name: String,
}

impl<I: FunctionInvoker> FunctionSink<I> {
    pub fn new(invoker: I, function_name: impl Into<String>) -> Self {
        Self {
            invoker,
            function_name: function_name.into(),
        }
    }
}

#[async_trait]
impl<I: FunctionInvoker> EventSink for FunctionSink<I> {
    async fn deliver(&self, event: &Event) -> Result<String, RelayError> {
        let payload = event.to_body()?;
        self.invoker
            .invoke_async(&self.function_name, payload.as_bytes())
            .await
            .map_err(|error| {
                RelayError::delivery(
                    Destination::Function {
                        name: self.function_name.clone(),
                    }
                    .to_string(),
                    error,
                )
            })
    }
}
