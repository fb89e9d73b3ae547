//! Pre-execution admission policy
//!
//! A narrow, statically-typed interface evaluated before a job is
//! admitted. The core only understands the four decisions; how they are
//! produced is up to the implementation: a compiled predicate, or an
//! adapter that runs an external script through an interpreter.

use crate::model::job::JobUid;
use crate::utils::errors::{NodeError, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;
use ulid::Ulid;

/// Decision returned by a pre-execution policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Admit the job
    Allow,
    /// Reject the job
    Reject,
    /// Reject the job and log that the policy asked the node to stop
    Exit,
    /// Request a node self-restart; only honored when containerized and idle
    Restart,
}

/// Context handed to a policy evaluation
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub node_uid: Ulid,
    pub node_name: String,
    pub job_uid: JobUid,
    pub job_name: String,
    pub active_runners: usize,
    /// Current variable set, exposed to script adapters as environment
    pub variables: HashMap<String, String>,
}

/// Pre-execution admission policy
pub trait PreExecutePolicy: Send + Sync {
    fn evaluate<'a>(&'a self, context: &'a PolicyContext) -> BoxFuture<'a, Result<PolicyDecision>>;
}

/// Policy backed by a compiled predicate
pub struct PredicatePolicy {
    predicate: Box<dyn Fn(&PolicyContext) -> bool + Send + Sync>,
}

impl PredicatePolicy {
    pub fn new(predicate: impl Fn(&PolicyContext) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
        }
    }
}

impl PreExecutePolicy for PredicatePolicy {
    fn evaluate<'a>(&'a self, context: &'a PolicyContext) -> BoxFuture<'a, Result<PolicyDecision>> {
        Box::pin(async move {
            Ok(if (self.predicate)(context) {
                PolicyDecision::Allow
            } else {
                PolicyDecision::Reject
            })
        })
    }
}

/// Policy backed by an external script run through an interpreter
///
/// The script receives the context as `FLUX_`-prefixed environment
/// variables plus the current variable set, and answers through its last
/// non-empty stdout line: `false`/`0` reject, `exit` and `restart` map to
/// their decisions, anything else truthy admits.
pub struct ScriptPolicy {
    script: PathBuf,
    interpreter: PathBuf,
}

impl ScriptPolicy {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            interpreter: PathBuf::from("/bin/sh"),
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = interpreter.into();
        self
    }
}

impl PreExecutePolicy for ScriptPolicy {
    fn evaluate<'a>(&'a self, context: &'a PolicyContext) -> BoxFuture<'a, Result<PolicyDecision>> {
        Box::pin(async move {
            let mut command = tokio::process::Command::new(&self.interpreter);
            command
                .arg(&self.script)
                .env("FLUX_NODE_UID", context.node_uid.to_string())
                .env("FLUX_NODE_NAME", &context.node_name)
                .env("FLUX_JOB_UID", context.job_uid.to_string())
                .env("FLUX_JOB_NAME", &context.job_name)
                .env("FLUX_ACTIVE_RUNNERS", context.active_runners.to_string());
            for (key, value) in &context.variables {
                command.env(key, value);
            }

            let output = command.output().await.map_err(|e| {
                NodeError::Policy(format!(
                    "Failed to run script {}: {e}",
                    self.script.display()
                ))
            })?;

            if !output.status.success() {
                return Err(NodeError::Policy(format!(
                    "Script {} exited with {}: {}",
                    self.script.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let decision = decision_from_output(&stdout);
            debug!(script = %self.script.display(), ?decision, "Pre-execute script evaluated");
            Ok(decision)
        })
    }
}

/// Interpret a script's stdout as a policy decision
pub fn decision_from_output(stdout: &str) -> PolicyDecision {
    let answer = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");

    match answer.to_ascii_lowercase().as_str() {
        "" | "false" | "0" => PolicyDecision::Reject,
        "exit" => PolicyDecision::Exit,
        "restart" => PolicyDecision::Restart,
        _ => PolicyDecision::Allow,
    }
}
