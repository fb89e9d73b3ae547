//! RPC wire types
//!
//! The supervisor and the job subprocess exchange newline-terminated JSON
//! documents, one per line, UTF-8, with PascalCase field names. A request
//! with `Id == 0` is fire-and-forget: no response may be written for it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Literal greeting line a subprocess may send immediately after
/// connecting; discarded without dispatch.
pub const GREETING: &str = "hello runner";

/// Method name of the server-initiated cooperative abort push.
pub const ABORT_METHOD: &str = "Abort";

/// An inbound call from the subprocess
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RpcRequest {
    /// Correlation id; `0` means no response is expected
    #[serde(default)]
    pub id: i64,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Fire-and-forget request
    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::new(0, method, params)
    }

    pub fn is_notification(&self) -> bool {
        self.id == 0
    }
}

/// An outbound reply, carrying either a result or an error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RpcResponse {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn result(id: i64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: i64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// The `{"Method":"Abort"}` push line, without the request/response envelope
pub fn abort_push_line() -> String {
    serde_json::json!({ "Method": ABORT_METHOD }).to_string()
}
