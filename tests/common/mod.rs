//! Shared test doubles and fixtures
#![allow(dead_code)]

use fluxfile_node::coordinator::{CoordinatorClient, Severity};
use fluxfile_node::model::{Job, JobUid, Node};
use fluxfile_node::runtime::RunnerOptions;
use fluxfile_node::{NodeError, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

/// Coordinator double that records every call
pub struct RecordingCoordinator {
    pub connected: AtomicBool,
    /// Value returned by `file_start_processing`
    pub accept_start: AtomicBool,
    /// When set, `file_start_processing` fails outright
    pub start_error: AtomicBool,
    pub started: Mutex<Vec<JobUid>>,
    pub finished: Mutex<Vec<(Job, String)>>,
    pub appended: Mutex<Vec<(JobUid, String, bool)>>,
    pub notifications: Mutex<Vec<(Severity, String)>>,
}

impl RecordingCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            accept_start: AtomicBool::new(true),
            start_error: AtomicBool::new(false),
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            appended: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        })
    }

    pub fn finished_jobs(&self) -> Vec<(Job, String)> {
        self.finished.lock().clone()
    }
}

impl CoordinatorClient for RecordingCoordinator {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn file_start_processing<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if self.start_error.load(Ordering::SeqCst) {
                return Err(NodeError::Coordinator("start processing failed".into()));
            }
            self.started.lock().push(job.uid);
            Ok(self.accept_start.load(Ordering::SeqCst))
        })
    }

    fn file_finish_processing<'a>(
        &'a self,
        job: &'a Job,
        log: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.finished.lock().push((job.clone(), log.to_string()));
            Ok(())
        })
    }

    fn file_log_append<'a>(
        &'a self,
        uid: JobUid,
        text: &'a str,
        is_first: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.appended.lock().push((uid, text.to_string(), is_first));
            Ok(())
        })
    }

    fn notify<'a>(&'a self, severity: Severity, message: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.notifications.lock().push((severity, message.to_string()));
            Ok(())
        })
    }
}

/// Write an executable shell script and return its path
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Node descriptor rooted in a scratch directory
pub fn test_node(temp_path: &Path, runner_executable: &Path, max_runners: usize) -> Arc<Node> {
    Arc::new(Node {
        uid: Ulid::new(),
        name: "test-node".into(),
        max_runners,
        temp_path: temp_path.to_path_buf(),
        runner_executable: runner_executable.to_path_buf(),
        pre_execute_script: None,
        keep_failed_files: false,
        containerized: false,
    })
}

/// Supervision timings tightened for tests
pub fn fast_options() -> RunnerOptions {
    RunnerOptions {
        no_output_timeout: Duration::from_secs(30),
        abort_grace: Duration::from_millis(300),
        watchdog_interval: Duration::from_millis(50),
        admission_wait: Duration::from_secs(10),
    }
}

/// Poll until the condition holds or the deadline passes
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
