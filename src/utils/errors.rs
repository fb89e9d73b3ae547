//! Error types for the node execution runtime

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the node runtime
#[derive(Debug, Error)]
pub enum NodeError {
    /// The job's flow is not present in the configuration revision
    #[error("Flow not found")]
    FlowNotFound,

    /// The job-unique working directory could not be created
    #[error("Failed to create working directory {path}: {source}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The runner subprocess could not be launched
    #[error("Failed to launch runner process: {0}")]
    LaunchFailed(String),

    /// RPC channel transport failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// A coordinator call failed
    #[error("Coordinator error: {0}")]
    Coordinator(String),

    /// Pre-execution policy evaluation failed
    #[error("Policy evaluation failed: {0}")]
    Policy(String),

    /// Tracing or metrics initialization failed
    #[error("Observability init failed: {0}")]
    Observability(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Flow definition error: {0}")]
    FlowDefinition(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_not_found_message() {
        assert_eq!(NodeError::FlowNotFound.to_string(), "Flow not found");
    }

    #[test]
    fn test_working_directory_carries_path() {
        let err = NodeError::WorkingDirectory {
            path: PathBuf::from("/tmp/runner-x"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let text = err.to_string();
        assert!(text.contains("/tmp/runner-x"));
        assert!(text.contains("denied"));
    }
}
