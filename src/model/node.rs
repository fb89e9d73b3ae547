//! Node descriptor
//!
//! Supplied per job by the node shell; the runtime never mutates it.

use std::path::PathBuf;
use ulid::Ulid;

/// Identity and policy of the executing machine
#[derive(Debug, Clone)]
pub struct Node {
    /// Node UID
    pub uid: Ulid,

    /// Display name
    pub name: String,

    /// Maximum concurrent runners admitted on this node
    pub max_runners: usize,

    /// Temp working path; job working directories and channel sockets live here
    pub temp_path: PathBuf,

    /// Executable launched as the job subprocess
    pub runner_executable: PathBuf,

    /// Name of the pre-execute system script, if the node declares one
    pub pre_execute_script: Option<String>,

    /// Keep working directories of failed jobs for inspection
    pub keep_failed_files: bool,

    /// Whether the node runs inside a container
    pub containerized: bool,
}
