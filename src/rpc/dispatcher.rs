//! RPC method dispatch
//!
//! A registry mapping method names to async handlers, separate from the
//! transport so the same registry can serve independently registered
//! handler groups (file operations, run-info updates, statistics).
//!
//! "Unknown method" is deliberately not an error: callers poll for
//! optional methods, so it is a tagged outcome that converts to a
//! `Result` payload on the wire and can be suppressed from logs.

use crate::rpc::message::{RpcRequest, RpcResponse};
use futures::future::BoxFuture;
use metrics::counter;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Outcome of dispatching a single method call
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Handler completed; carries its return value
    Ok(Value),
    /// No handler registered under the method name
    Unknown,
    /// Handler failed; carries the innermost error message
    Error(String),
}

/// Method-name to handler registry
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a method name; the last registration for a
    /// name wins.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| Box::pin(handler(params)));
        self.handlers.write().insert(method.into(), handler);
    }

    /// Invoke the handler registered for a method
    pub async fn dispatch(&self, method: &str, params: Vec<Value>) -> DispatchOutcome {
        let handler = self.handlers.read().get(method).cloned();
        let Some(handler) = handler else {
            return DispatchOutcome::Unknown;
        };

        match handler(params).await {
            Ok(value) => DispatchOutcome::Ok(value),
            Err(error) => DispatchOutcome::Error(innermost_message(&error)),
        }
    }

    /// Execute a decoded request and produce the response to send back, if any
    ///
    /// Returns `None` when the call was a notification with nothing to
    /// report; the transport additionally suppresses any response whose
    /// request id was `0`.
    pub async fn handle_request(&self, request: RpcRequest) -> Option<RpcResponse> {
        counter!("fluxfile_node_rpc_requests_total").increment(1);

        match self.dispatch(&request.method, request.params.clone()).await {
            DispatchOutcome::Unknown => Some(RpcResponse::result(
                request.id,
                Value::String(format!("Unknown method '{}'", request.method)),
            )),
            DispatchOutcome::Error(message) => {
                warn!(method = %request.method, %message, "RPC handler failed");
                Some(RpcResponse::error(
                    request.id,
                    format!("Error in method '{}': {}", request.method, message),
                ))
            }
            DispatchOutcome::Ok(value) => {
                if value.is_null() && request.is_notification() {
                    None
                } else {
                    Some(RpcResponse::result(request.id, value))
                }
            }
        }
    }
}

/// Unwrap a nested error chain to its innermost message
fn innermost_message(error: &anyhow::Error) -> String {
    error
        .chain()
        .last()
        .map(|cause| cause.to_string())
        .unwrap_or_else(|| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use serde_json::json;

    #[tokio::test]
    async fn test_registered_handler_round_trip() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("Ping", |_params| async { Ok(json!("pong")) });

        let response = dispatcher
            .handle_request(RpcRequest::new(5, "Ping", vec![]))
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"Id":5,"Result":"pong"}"#
        );
    }

    #[tokio::test]
    async fn test_unknown_method_is_result_not_error() {
        let dispatcher = Dispatcher::new();

        let response = dispatcher
            .handle_request(RpcRequest::new(7, "DoesNotExist", vec![]))
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"Id":7,"Result":"Unknown method 'DoesNotExist'"}"#
        );
    }

    #[tokio::test]
    async fn test_handler_error_unwraps_to_innermost_message() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("Explode", |_params| async {
            let inner: anyhow::Result<Value> = Err(anyhow::anyhow!("disk full"));
            inner.context("while writing output")
        });

        let response = dispatcher
            .handle_request(RpcRequest::new(9, "Explode", vec![]))
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert!(error.contains("Explode"));
        assert!(error.contains("disk full"));
        assert!(!error.contains("while writing output"));
    }

    #[tokio::test]
    async fn test_notification_with_null_result_produces_no_response() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("Log", |_params| async { Ok(Value::Null) });

        let response = dispatcher
            .handle_request(RpcRequest::notification("Log", vec![json!("line")]))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_notification_with_result_still_builds_response() {
        // The transport is responsible for suppressing it on the wire.
        let dispatcher = Dispatcher::new();
        dispatcher.register("Peek", |_params| async { Ok(json!(1)) });

        let response = dispatcher
            .handle_request(RpcRequest::notification("Peek", vec![]))
            .await
            .unwrap();
        assert_eq!(response.id, 0);
        assert_eq!(response.result, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("Ping", |_params| async { Ok(json!("old")) });
        dispatcher.register("Ping", |_params| async { Ok(json!("new")) });

        let response = dispatcher
            .handle_request(RpcRequest::new(1, "Ping", vec![]))
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!("new")));
    }

    #[tokio::test]
    async fn test_handler_receives_positional_params() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("Add", |params| async move {
            let a = params[0].as_i64().context("first operand")?;
            let b = params[1].as_i64().context("second operand")?;
            Ok(json!(a + b))
        });

        let response = dispatcher
            .handle_request(RpcRequest::new(2, "Add", vec![json!(2), json!(3)]))
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!(5)));
    }
}
