//! Node configuration loading
//!
//! Configuration is layered: an optional config file, overridden by
//! `FLUXFILE_`-prefixed environment variables (`FLUXFILE_NODE__MAX_RUNNERS`
//! maps to `node.max_runners`).

use crate::model::node::Node;
use crate::utils::errors::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use ulid::Ulid;

/// Top-level node configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub metrics: MetricsSection,
}

/// The node descriptor section
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Node UID; generated when absent
    #[serde(default)]
    pub uid: Option<Ulid>,

    /// Maximum concurrent runners
    #[serde(default = "default_max_runners")]
    pub max_runners: usize,

    /// Temp working path for job directories and channel sockets
    #[serde(default = "default_temp_path")]
    pub temp_path: PathBuf,

    /// Executable launched for each job's subprocess
    #[serde(default = "default_runner_executable")]
    pub runner_executable: PathBuf,

    /// Name of the pre-execute system script, if any
    #[serde(default)]
    pub pre_execute_script: Option<String>,

    /// Keep working directories of failed jobs
    #[serde(default)]
    pub keep_failed_files: bool,

    /// Whether this node runs inside a container
    #[serde(default)]
    pub containerized: bool,
}

/// Coordinator connection settings, passed through to subprocesses
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_server_url")]
    pub url: String,
    #[serde(default)]
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// Emit JSON-formatted log lines
    #[serde(default)]
    pub json: bool,
    /// Default tracing filter when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

fn default_node_name() -> String {
    "fluxfile-node".to_string()
}

fn default_max_runners() -> usize {
    2
}

fn default_temp_path() -> PathBuf {
    std::env::temp_dir().join("fluxfile")
}

fn default_runner_executable() -> PathBuf {
    PathBuf::from("fluxfile-runner")
}

fn default_server_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            access_token: String::new(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_log_filter(),
        }
    }
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from an optional file path plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match path {
            Some(path) => builder.add_source(File::from(path)),
            None => builder.add_source(File::with_name("fluxfile-node").required(false)),
        };

        builder = builder.add_source(Environment::with_prefix("FLUXFILE").separator("__"));

        let config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Build the node descriptor from the loaded configuration
    pub fn to_node(&self) -> Node {
        Node {
            uid: self.node.uid.unwrap_or_else(Ulid::new),
            name: self.node.name.clone(),
            max_runners: self.node.max_runners,
            temp_path: self.node.temp_path.clone(),
            runner_executable: self.node.runner_executable.clone(),
            pre_execute_script: self.node.pre_execute_script.clone(),
            keep_failed_files: self.node.keep_failed_files,
            containerized: self.node.containerized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[node]
name = "node-a"
max_runners = 4
temp_path = "/tmp/fluxfile-test"
keep_failed_files = true

[server]
url = "http://coordinator:5000"
access_token = "secret"
"#
        )
        .unwrap();

        let config = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.node.name, "node-a");
        assert_eq!(config.node.max_runners, 4);
        assert!(config.node.keep_failed_files);
        assert_eq!(config.server.url, "http://coordinator:5000");

        let node = config.to_node();
        assert_eq!(node.max_runners, 4);
        assert_eq!(node.temp_path, PathBuf::from("/tmp/fluxfile-test"));
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "[node]\nname = \"bare\"\n").unwrap();

        let config = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.node.max_runners, 2);
        assert!(!config.node.containerized);
        assert!(!config.logging.json);
        assert_eq!(config.logging.filter, "info");
        assert!(!config.metrics.enabled);
    }
}
