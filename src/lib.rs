//! Fluxfile Node Execution Runtime
//!
//! This library is the node-side core of the Fluxfile file-processing
//! platform: it decides whether a new job may start, launches and
//! supervises the subprocess that performs the work, and exchanges
//! structured calls with it over a private, bidirectional channel.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **runtime**: admission control, runner supervision, policy evaluation
//! - **rpc**: the supervisor ↔ subprocess line-delimited JSON protocol
//! - **model**: jobs, flows, configuration revisions, the node descriptor
//! - **coordinator**: the contract the embedding node shell implements
//! - **observability**: tracing and metrics initialization
//! - **utils**: errors and configuration loading
//!
//! The coordinator itself (job queue, persistence, admin UI) lives outside
//! this crate and is consumed through the [`coordinator::CoordinatorClient`]
//! trait.

// Public module exports
pub mod coordinator;
pub mod model;
pub mod observability;
pub mod rpc;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use coordinator::{CoordinatorClient, Severity};
pub use model::{ConfigurationRevision, Flow, Job, JobStatus, JobUid, Node};
pub use rpc::{ChannelServer, Dispatcher, RpcRequest, RpcResponse};
pub use runtime::{AdmissionOutcome, RunnerInfo, RunnerManager, RunnerOptions};
pub use utils::config::NodeConfig;
pub use utils::errors::{NodeError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
