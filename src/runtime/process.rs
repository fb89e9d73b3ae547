//! Subprocess launch and termination
//!
//! The runner executable is resolved from PATH when given as a bare
//! command name. Stdout/stderr are piped so the supervisor can observe
//! liveness and capture logs.

use crate::model::job::JobUid;
use crate::utils::errors::{NodeError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use ulid::Ulid;

/// Launch parameters for one job's subprocess
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// The runner executable (bare name or path)
    pub executable: PathBuf,

    /// Endpoint name of the job's RPC channel (`runner-{uid}`)
    pub endpoint: String,

    /// Directory holding the channel socket
    pub runtime_dir: PathBuf,

    pub job_uid: JobUid,
    pub node_uid: Ulid,

    /// Job-unique working directory
    pub working_dir: PathBuf,

    /// Path of the configuration revision on disk
    pub revision_path: PathBuf,

    /// Coordinator credentials so the subprocess can make its own calls
    /// back through the channel
    pub server_url: String,
    pub access_token: String,
}

impl LaunchSpec {
    fn to_args(&self) -> Vec<String> {
        vec![
            "--endpoint".into(),
            self.endpoint.clone(),
            "--runtime-dir".into(),
            self.runtime_dir.display().to_string(),
            "--uid".into(),
            self.job_uid.to_string(),
            "--node".into(),
            self.node_uid.to_string(),
            "--working-dir".into(),
            self.working_dir.display().to_string(),
            "--config".into(),
            self.revision_path.display().to_string(),
            "--server".into(),
            self.server_url.clone(),
            "--access-token".into(),
            self.access_token.clone(),
        ]
    }
}

/// Resolve the runner executable, consulting PATH for bare names
pub fn resolve_executable(executable: &Path) -> Result<PathBuf> {
    if executable.components().count() > 1 {
        return Ok(executable.to_path_buf());
    }

    which::which(executable).map_err(|e| {
        NodeError::LaunchFailed(format!(
            "Executable '{}' not found in PATH: {e}",
            executable.display()
        ))
    })
}

/// Spawn the job subprocess with piped stdio
pub fn spawn(spec: &LaunchSpec) -> Result<Child> {
    let executable = resolve_executable(&spec.executable)?;

    debug!(job = %spec.job_uid, executable = %executable.display(), "Spawning runner process");

    let mut command = Command::new(executable);
    command
        .args(spec.to_args())
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    command
        .spawn()
        .map_err(|e| NodeError::LaunchFailed(format!("Failed to spawn runner process: {e}")))
}

/// Graceful termination: SIGTERM, a short wait, then SIGKILL if still alive
pub async fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid as i32);

    debug!("Sending SIGTERM to PID {}", pid);
    if let Err(error) = kill(pid, Signal::SIGTERM) {
        warn!(%error, "Failed to send SIGTERM to PID {}", pid);
        return;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    if kill(pid, None).is_ok() {
        debug!("Process still alive, sending SIGKILL to PID {}", pid);
        if let Err(error) = kill(pid, Signal::SIGKILL) {
            warn!(%error, "Failed to send SIGKILL to PID {}", pid);
        }
    }
}

/// Immediate SIGKILL
pub fn kill_hard(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid as i32);
    if let Err(error) = kill(pid, Signal::SIGKILL) {
        warn!(%error, "Failed to send SIGKILL to PID {}", pid);
    }
}

/// Check whether a process is still running
pub fn is_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}
