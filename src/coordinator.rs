//! Coordinator contract
//!
//! The coordinator owns the durable job queue and file status persistence;
//! the node shell implements this trait over the wire. The runtime only
//! consumes it: admission must get a successful start acknowledgment, and
//! completion persists the final job and its run log. Persistence failures
//! after completion are logged locally, never re-thrown.

use crate::model::job::{Job, JobUid};
use crate::utils::errors::Result;
use futures::future::BoxFuture;

/// Severity of a node-originated notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Client for the central coordinator
pub trait CoordinatorClient: Send + Sync {
    /// Process-wide liveness: whether the node currently has a connection
    /// to the coordinator. Consulted by the RPC channel before dispatching
    /// any inbound subprocess call.
    fn is_connected(&self) -> bool;

    /// Tell the coordinator a job has started processing. Must return
    /// `Ok(true)` before a runner is allowed to proceed.
    fn file_start_processing<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<bool>>;

    /// Persist the final job record and its accumulated run log.
    fn file_finish_processing<'a>(&'a self, job: &'a Job, log: &'a str)
        -> BoxFuture<'a, Result<()>>;

    /// Append a chunk of run log for a job; `is_first` resets any
    /// previously stored log for the current attempt.
    fn file_log_append<'a>(
        &'a self,
        uid: JobUid,
        text: &'a str,
        is_first: bool,
    ) -> BoxFuture<'a, Result<()>>;

    /// Notification side-channel for operator-visible warnings.
    fn notify<'a>(&'a self, severity: Severity, message: &'a str) -> BoxFuture<'a, Result<()>>;
}
