//! Runner: supervises exactly one job's subprocess
//!
//! Lifecycle: resolve the flow, create the working directory, start the
//! RPC channel, launch the subprocess, pump its output for liveness and
//! log capture, race process exit against the abort/no-output watchdog,
//! resolve the terminal status, then finalize (cleanup, log persistence,
//! completion callback). The completion callback fires on every path so
//! the concurrency slot is always released.

use crate::coordinator::CoordinatorClient;
use crate::model::flow::ConfigurationRevision;
use crate::model::job::{Job, JobStatus, JobUid};
use crate::model::node::Node;
use crate::rpc::channel::ChannelServer;
use crate::rpc::dispatcher::Dispatcher;
use crate::runtime::process::{self, LaunchSpec};
use crate::runtime::run_log::RunLog;
use crate::utils::errors::{NodeError, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Reserved exit code: keep temporary files, treat the run as successful
pub const KEEP_FILES_EXIT_CODE: i32 = 100;

/// Stdout lines equal to this token refresh liveness without being logged
pub const HEARTBEAT_LINE: &str = "::heartbeat::";

/// Timeouts and intervals governing runner supervision
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Kill the subprocess after this long without any output
    pub no_output_timeout: Duration,

    /// How long an aborted subprocess gets to exit on its own
    pub abort_grace: Duration,

    /// Watchdog poll interval
    pub watchdog_interval: Duration,

    /// Bounded wait for the admission gate
    pub admission_wait: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            no_output_timeout: Duration::from_secs(600),
            abort_grace: Duration::from_secs(20),
            watchdog_interval: Duration::from_secs(5),
            admission_wait: Duration::from_secs(10),
        }
    }
}

/// Progress snapshot for one in-flight job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunnerInfo {
    pub job_uid: JobUid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub current_step: String,
    #[serde(default)]
    pub step_percent: f32,
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub node_uid: Option<Ulid>,
    #[serde(default)]
    pub flow_uid: Option<Ulid>,
    #[serde(default)]
    pub flow_name: String,
}

impl RunnerInfo {
    /// Merge a subprocess-reported snapshot: progress fields are taken
    /// from the report, identity and supervisory fields are preserved.
    pub fn merge_reported(&mut self, reported: &RunnerInfo) {
        self.current_step = reported.current_step.clone();
        self.step_percent = reported.step_percent;
        if !reported.job_name.is_empty() {
            self.job_name = reported.job_name.clone();
        }
    }
}

/// Invoked exactly once per runner with the job UID when it completes
pub type CompletionHook = Arc<dyn Fn(JobUid) + Send + Sync>;

enum Watch {
    /// External abort observed; the caller owns the graceful shutdown
    Cancelled,
    /// No-output timeout fired; the subprocess was already force-killed
    NoOutputKilled,
}

struct Resolution {
    status: JobStatus,
    reason: Option<String>,
    keep_files: bool,
}

/// Resolve the terminal status from the subprocess's self-reported state
/// and its raw exit code
fn resolve_outcome(
    reported: JobStatus,
    exit_code: Option<i32>,
    aborted: bool,
    no_output: bool,
    no_output_timeout: Duration,
) -> Resolution {
    let mut keep_files = false;
    let mut effective = exit_code;
    if exit_code == Some(KEEP_FILES_EXIT_CODE) {
        keep_files = true;
        effective = Some(0);
    }

    if aborted && reported != JobStatus::Processed {
        return Resolution {
            status: JobStatus::ProcessingFailed,
            reason: Some("Aborted by user".to_string()),
            keep_files,
        };
    }

    // The subprocess never updated its status; fall back to the exit code.
    if matches!(reported, JobStatus::Processing | JobStatus::Unprocessed) {
        return match effective.and_then(JobStatus::from_code) {
            Some(status) => Resolution {
                status,
                reason: None,
                keep_files,
            },
            None => {
                let reason = if no_output {
                    format!(
                        "No output received in {} seconds",
                        no_output_timeout.as_secs()
                    )
                } else if let Some(code) = effective {
                    format!("Unexpected exit code {code}")
                } else {
                    "Runner process terminated by signal".to_string()
                };
                Resolution {
                    status: JobStatus::ProcessingFailed,
                    reason: Some(reason),
                    keep_files,
                }
            }
        };
    }

    Resolution {
        status: reported,
        reason: None,
        keep_files,
    }
}

/// Supervisor for one job's subprocess
pub struct Runner {
    node: Arc<Node>,
    revision: Arc<ConfigurationRevision>,
    coordinator: Arc<dyn CoordinatorClient>,
    options: RunnerOptions,
    server_url: String,
    access_token: String,

    /// Working copy of the job, mutated by RPC handlers
    job: Arc<RwLock<Job>>,
    info: Arc<RwLock<RunnerInfo>>,
    run_log: Arc<RunLog>,
    statistics: Arc<Mutex<Vec<(String, Value)>>>,

    cancel: CancellationToken,
    aborted: AtomicBool,
    aborted_no_output: AtomicBool,
    keep_files: AtomicBool,
    running: AtomicBool,
    last_output: Arc<Mutex<Instant>>,

    channel: Mutex<Option<Arc<ChannelServer>>>,
    working_dir: Mutex<Option<std::path::PathBuf>>,

    on_complete: CompletionHook,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: Job,
        node: Arc<Node>,
        revision: Arc<ConfigurationRevision>,
        coordinator: Arc<dyn CoordinatorClient>,
        options: RunnerOptions,
        server_url: String,
        access_token: String,
        on_complete: CompletionHook,
    ) -> Arc<Self> {
        let info = RunnerInfo {
            job_uid: job.uid,
            job_name: job.name.clone(),
            started_at: Utc::now(),
            current_step: String::new(),
            step_percent: 0.0,
            aborted: false,
            node_uid: job.node_uid,
            flow_uid: job.flow_uid,
            flow_name: job.flow_name.clone(),
        };

        Arc::new(Self {
            node,
            revision,
            coordinator,
            options,
            server_url,
            access_token,
            job: Arc::new(RwLock::new(job)),
            info: Arc::new(RwLock::new(info)),
            run_log: Arc::new(RunLog::new()),
            statistics: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
            aborted: AtomicBool::new(false),
            aborted_no_output: AtomicBool::new(false),
            keep_files: AtomicBool::new(false),
            running: AtomicBool::new(false),
            last_output: Arc::new(Mutex::new(Instant::now())),
            channel: Mutex::new(None),
            working_dir: Mutex::new(None),
            on_complete,
        })
    }

    pub fn job(&self) -> Job {
        self.job.read().clone()
    }

    pub fn info(&self) -> RunnerInfo {
        self.info.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Working directory still on disk after completion (keep-files paths)
    pub fn working_dir(&self) -> Option<std::path::PathBuf> {
        self.working_dir.lock().clone()
    }

    /// Statistics reported by the subprocess
    pub fn statistics(&self) -> Vec<(String, Value)> {
        self.statistics.lock().clone()
    }

    /// Merge a subprocess-reported progress snapshot
    pub fn update_reported(&self, reported: &RunnerInfo) {
        self.info.write().merge_reported(reported);
    }

    /// Request a cooperative abort: push the Abort notification and signal
    /// the watchdog; the run loop handles grace and forced termination.
    pub async fn abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.info.write().aborted = true;
        info!(job = %self.job.read().uid, "Abort requested");

        let channel = self.channel.lock().clone();
        if let Some(channel) = channel {
            if let Err(error) = channel.abort().await {
                debug!(%error, "Cooperative abort push failed");
            }
        }
        self.cancel.cancel();
    }

    /// Execute the job to completion
    ///
    /// Never lets an error escape: failures become a ProcessingFailed
    /// outcome, and the completion callback always fires.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let uid = self.job.read().uid;

        if let Err(error) = self.execute().await {
            error!(job = %uid, %error, "Job execution failed");
            self.run_log.append(&format!("Execution error: {error}"));
            let mut job = self.job.write();
            if job.status != JobStatus::ProcessingFailed {
                job.fail(error.to_string());
            }
        }

        self.finalize().await;
        (self.on_complete)(uid);
        self.running.store(false, Ordering::SeqCst);
    }

    async fn execute(self: &Arc<Self>) -> Result<()> {
        let (uid, flow_uid) = {
            let job = self.job.read();
            (job.uid, job.flow_uid)
        };

        // 1. Resolve the flow from the configuration revision.
        let flow = flow_uid
            .and_then(|uid| self.revision.flow(uid))
            .cloned()
            .ok_or(NodeError::FlowNotFound)?;

        // 2. Job-unique working directory under the node's temp path.
        let working_dir = self.node.temp_path.join(format!("runner-{uid}"));
        if let Err(source) = std::fs::create_dir_all(&working_dir) {
            if self.node.containerized {
                error!(
                    path = %working_dir.display(),
                    "Could not create working directory; verify the temp path volume mapping of this container"
                );
            }
            return Err(NodeError::WorkingDirectory {
                path: working_dir,
                source,
            });
        }
        *self.working_dir.lock() = Some(working_dir.clone());

        // 3. RPC channel bound to the job-unique endpoint.
        let dispatcher = Arc::new(Dispatcher::new());
        self.register_handlers(&dispatcher, flow.debug_logging);
        let channel = Arc::new(ChannelServer::new(
            &self.node.temp_path,
            uid,
            dispatcher,
            Arc::clone(&self.coordinator),
        ));
        channel.start()?;
        *self.channel.lock() = Some(Arc::clone(&channel));

        // 4. Launch the subprocess with the endpoint name as an argument.
        let spec = LaunchSpec {
            executable: self.node.runner_executable.clone(),
            endpoint: channel.endpoint().to_string(),
            runtime_dir: self.node.temp_path.clone(),
            job_uid: uid,
            node_uid: self.node.uid,
            working_dir,
            revision_path: self.revision.path().to_path_buf(),
            server_url: self.server_url.clone(),
            access_token: self.access_token.clone(),
        };
        let mut child = process::spawn(&spec)?;
        let pid = child.id();
        info!(job = %uid, pid = ?pid, "Runner process started");

        // 5. Pump stdout/stderr for liveness and log capture.
        *self.last_output.lock() = Instant::now();
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(self.spawn_pump(stdout, flow.debug_logging));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(self.spawn_pump(stderr, flow.debug_logging));
        }

        // 6/7. Race process exit against the abort/no-output watchdog.
        let exit = self.supervise(&mut child, pid).await;

        for pump in pumps {
            let _ = pump.await;
        }

        // 8. Resolve the terminal status.
        let resolution = resolve_outcome(
            self.job.read().status,
            exit.as_ref().and_then(ExitStatus::code),
            self.aborted.load(Ordering::SeqCst),
            self.aborted_no_output.load(Ordering::SeqCst),
            self.options.no_output_timeout,
        );
        if resolution.keep_files {
            self.keep_files.store(true, Ordering::SeqCst);
            self.run_log
                .append("Runner requested temporary files be kept");
        }
        {
            let mut job = self.job.write();
            job.status = resolution.status;
            if let Some(reason) = resolution.reason {
                job.failure_reason = Some(reason);
            } else if job.status == JobStatus::ProcessingFailed && job.failure_reason.is_none() {
                job.failure_reason = Some("Processing failed".to_string());
            }
        }

        info!(
            job = %uid,
            status = %self.job.read().status,
            exit = ?exit.as_ref().and_then(ExitStatus::code),
            "Runner process finished"
        );
        Ok(())
    }

    /// Wait for process exit, the abort signal, or the no-output timeout
    async fn supervise(&self, child: &mut Child, pid: Option<u32>) -> Option<ExitStatus> {
        let outcome = tokio::select! {
            status = child.wait() => return match status {
                Ok(status) => Some(status),
                Err(error) => {
                    warn!(%error, "Failed to await runner process");
                    None
                }
            },
            watch = self.watchdog(pid) => watch,
        };

        match outcome {
            Watch::Cancelled => {
                // The cooperative abort was already pushed; grant the
                // subprocess a grace period to exit on its own.
                match tokio::time::timeout(self.options.abort_grace, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    Ok(Err(error)) => {
                        warn!(%error, "Failed to await runner process after abort");
                        None
                    }
                    Err(_) => {
                        warn!(
                            "Runner process did not exit within {} seconds after abort; forcing termination",
                            self.options.abort_grace.as_secs()
                        );
                        self.run_log.append("Forced termination after abort grace period");
                        if let Some(pid) = pid {
                            process::kill_hard(pid);
                        }
                        child.wait().await.ok()
                    }
                }
            }
            Watch::NoOutputKilled => {
                // Already killed by the watchdog; reap it.
                match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => {
                        let _ = child.start_kill();
                        child.wait().await.ok()
                    }
                }
            }
        }
    }

    /// Poll for the external abort signal and the no-output timeout
    ///
    /// On cancellation, returns without killing: the graceful shutdown
    /// belongs to the caller. On no-output timeout, force-kills and
    /// returns.
    async fn watchdog(&self, pid: Option<u32>) -> Watch {
        let mut interval = tokio::time::interval(self.options.watchdog_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Watch::Cancelled,
                _ = interval.tick() => {
                    let silent = self.last_output.lock().elapsed();
                    if silent >= self.options.no_output_timeout {
                        self.aborted_no_output.store(true, Ordering::SeqCst);
                        let message = format!(
                            "No output received in {} seconds; killing runner process",
                            self.options.no_output_timeout.as_secs()
                        );
                        error!(job = %self.job.read().uid, "{message}");
                        self.run_log.append(&message);
                        if let Some(pid) = pid {
                            process::kill_hard(pid);
                        }
                        return Watch::NoOutputKilled;
                    }
                }
            }
        }
    }

    fn spawn_pump<R>(self: &Arc<Self>, stream: R, debug_logging: bool) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let run_log = Arc::clone(&self.run_log);
        let last_output = Arc::clone(&self.last_output);
        let coordinator = Arc::clone(&self.coordinator);
        let uid = self.job.read().uid;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                *last_output.lock() = Instant::now();
                if line.trim() == HEARTBEAT_LINE {
                    continue;
                }
                run_log.append(&line);
                if debug_logging {
                    let is_first = run_log.take_first_mirror();
                    if let Err(error) = coordinator.file_log_append(uid, &line, is_first).await {
                        debug!(%error, "Failed to mirror log line");
                    }
                }
            }
        })
    }

    /// Register the handler groups the subprocess may call
    fn register_handlers(self: &Arc<Self>, dispatcher: &Dispatcher, debug_logging: bool) {
        let uid = self.job.read().uid;

        let job = Arc::clone(&self.job);
        dispatcher.register("GetJob", move |_params| {
            let job = Arc::clone(&job);
            async move {
                let snapshot = job.read().clone();
                Ok(serde_json::to_value(snapshot)?)
            }
        });

        let job = Arc::clone(&self.job);
        dispatcher.register("UpdateJob", move |params| {
            let job = Arc::clone(&job);
            async move {
                let payload = params
                    .into_iter()
                    .next()
                    .context("UpdateJob requires a job payload")?;
                let reported: Job = serde_json::from_value(payload)?;
                *job.write() = reported;
                Ok(Value::Null)
            }
        });

        let info = Arc::clone(&self.info);
        dispatcher.register("UpdateRunnerInfo", move |params| {
            let info = Arc::clone(&info);
            async move {
                let payload = params
                    .into_iter()
                    .next()
                    .context("UpdateRunnerInfo requires an info payload")?;
                let reported: RunnerInfo = serde_json::from_value(payload)?;
                info.write().merge_reported(&reported);
                Ok(Value::Null)
            }
        });

        let run_log = Arc::clone(&self.run_log);
        let coordinator = Arc::clone(&self.coordinator);
        dispatcher.register("Log", move |params| {
            let run_log = Arc::clone(&run_log);
            let coordinator = Arc::clone(&coordinator);
            async move {
                let text = params
                    .iter()
                    .map(|value| match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                run_log.append(&text);
                if debug_logging {
                    let is_first = run_log.take_first_mirror();
                    if let Err(error) = coordinator.file_log_append(uid, &text, is_first).await {
                        debug!(%error, "Failed to mirror log line");
                    }
                }
                Ok(Value::Null)
            }
        });

        let statistics = Arc::clone(&self.statistics);
        dispatcher.register("RecordStatistic", move |params| {
            let statistics = Arc::clone(&statistics);
            async move {
                let mut params = params.into_iter();
                let name = params
                    .next()
                    .and_then(|v| v.as_str().map(String::from))
                    .context("RecordStatistic requires a name")?;
                let value = params.next().unwrap_or(Value::Null);
                statistics.lock().push((name, value));
                Ok(Value::Null)
            }
        });
    }

    /// Cleanup that must happen on every path: stop the channel, handle
    /// the working directory, persist the run log.
    async fn finalize(&self) {
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.stop().await;
        }

        let (uid, failed) = {
            let mut job = self.job.write();
            if job.processing_ended.is_none() {
                job.processing_ended = Some(Utc::now());
            }
            (job.uid, job.status == JobStatus::ProcessingFailed)
        };

        let keep_files = self.keep_files.load(Ordering::SeqCst);
        let working_dir = self.working_dir.lock().clone();
        if let Some(dir) = working_dir {
            if keep_files {
                info!(job = %uid, path = %dir.display(), "Keeping working directory as requested by runner");
            } else if failed && self.node.keep_failed_files {
                info!(job = %uid, path = %dir.display(), "Keeping failed files for inspection");
                self.run_log.append("Working directory retained (keep failed files)");
            } else if dir.exists() {
                if let Err(error) = std::fs::remove_dir_all(&dir) {
                    warn!(job = %uid, %error, "Failed to delete working directory");
                }
                *self.working_dir.lock() = None;
            }
        }

        let job = self.job.read().clone();
        let log = self.run_log.snapshot();
        if let Err(error) = self.coordinator.file_finish_processing(&job, &log).await {
            warn!(job = %uid, %error, "Failed to persist run log to coordinator");
        }

        if failed {
            counter!("fluxfile_node_jobs_failed_total").increment(1);
        } else {
            counter!("fluxfile_node_jobs_completed_total").increment(1);
        }
    }
}
