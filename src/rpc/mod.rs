//! Supervisor ↔ subprocess RPC
//!
//! This module implements the private channel between a runner's
//! supervisor and its job subprocess:
//!
//! - **message**: the line-delimited JSON wire types
//! - **dispatcher**: the method-name → handler registry
//! - **channel**: the single-connection Unix-socket server
//!
//! Responses carry the request's correlation id; callers must not assume
//! response ordering matches request ordering.

pub mod channel;
pub mod dispatcher;
pub mod message;

pub use channel::{endpoint_name, ChannelServer};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use message::{abort_push_line, RpcRequest, RpcResponse, ABORT_METHOD, GREETING};
