//! Runner manager: admission control and active-runner bookkeeping
//!
//! Admission decisions are serialized by a single mutex with a bounded
//! wait, so two near-simultaneous requests can never both observe "below
//! limit" and jointly exceed it. Once admitted, a runner executes fully
//! concurrently with other runners and with the admission gate.

use crate::coordinator::{CoordinatorClient, Severity};
use crate::model::flow::ConfigurationRevision;
use crate::model::job::{Job, JobUid};
use crate::model::node::Node;
use crate::runtime::policy::{PolicyContext, PolicyDecision, PreExecutePolicy};
use crate::runtime::runner::{CompletionHook, Runner, RunnerInfo, RunnerOptions};
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Delay before the process terminates itself on a Restart decision
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Closed enumeration of admission outcomes; rejections are expected
/// results, never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    CanProcess,
    AtMaximumRunners,
    PreCheckFailed,
    FailedToLocateTempPath,
    FlowNotFound,
    CannotProcess,
    UnknownError,
}

impl AdmissionOutcome {
    fn label(self) -> &'static str {
        match self {
            AdmissionOutcome::CanProcess => "can_process",
            AdmissionOutcome::AtMaximumRunners => "at_maximum_runners",
            AdmissionOutcome::PreCheckFailed => "pre_check_failed",
            AdmissionOutcome::FailedToLocateTempPath => "failed_to_locate_temp_path",
            AdmissionOutcome::FlowNotFound => "flow_not_found",
            AdmissionOutcome::CannotProcess => "cannot_process",
            AdmissionOutcome::UnknownError => "unknown_error",
        }
    }
}

/// Broadcast whenever the active-runner set changes
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Changed { active: usize },
}

type RestartHook = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    node: Arc<Node>,
    coordinator: Arc<dyn CoordinatorClient>,
    policy: Option<Arc<dyn PreExecutePolicy>>,
    options: RunnerOptions,
    server_url: String,
    access_token: String,
    runners: DashMap<JobUid, Arc<Runner>>,
    admission: tokio::sync::Mutex<()>,
    events: broadcast::Sender<RunnerEvent>,
    restart: RestartHook,
}

impl Inner {
    fn broadcast(&self) {
        let active = self.runners.len();
        gauge!("fluxfile_node_active_runners").set(active as f64);
        let _ = self.events.send(RunnerEvent::Changed { active });
    }
}

/// Admission control and bookkeeping for a node's runners
#[derive(Clone)]
pub struct RunnerManager {
    inner: Arc<Inner>,
}

/// Assembles a [`RunnerManager`]
pub struct RunnerManagerBuilder {
    node: Arc<Node>,
    coordinator: Arc<dyn CoordinatorClient>,
    policy: Option<Arc<dyn PreExecutePolicy>>,
    options: RunnerOptions,
    server_url: String,
    access_token: String,
    restart: RestartHook,
}

impl RunnerManagerBuilder {
    /// Install the pre-execution policy evaluated at admission
    pub fn policy(mut self, policy: Arc<dyn PreExecutePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    /// Coordinator credentials handed to each subprocess
    pub fn server(mut self, url: impl Into<String>, access_token: impl Into<String>) -> Self {
        self.server_url = url.into();
        self.access_token = access_token.into();
        self
    }

    /// Replace the self-restart hook (tests inject a recorder here)
    pub fn restart_hook(mut self, hook: RestartHook) -> Self {
        self.restart = hook;
        self
    }

    pub fn build(self) -> RunnerManager {
        let (events, _) = broadcast::channel(64);
        RunnerManager {
            inner: Arc::new(Inner {
                node: self.node,
                coordinator: self.coordinator,
                policy: self.policy,
                options: self.options,
                server_url: self.server_url,
                access_token: self.access_token,
                runners: DashMap::new(),
                admission: tokio::sync::Mutex::new(()),
                events,
                restart: self.restart,
            }),
        }
    }
}

impl RunnerManager {
    pub fn new(node: Arc<Node>, coordinator: Arc<dyn CoordinatorClient>) -> Self {
        Self::builder(node, coordinator).build()
    }

    pub fn builder(node: Arc<Node>, coordinator: Arc<dyn CoordinatorClient>) -> RunnerManagerBuilder {
        RunnerManagerBuilder {
            node,
            coordinator,
            policy: None,
            options: RunnerOptions::default(),
            server_url: String::new(),
            access_token: String::new(),
            restart: Arc::new(|| std::process::exit(0)),
        }
    }

    /// Subscribe to active-set change events
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.inner.events.subscribe()
    }

    pub fn active_count(&self) -> usize {
        self.inner.runners.len()
    }

    /// Progress snapshots of all active runners (status queries, UI polling)
    pub fn runner_info(&self) -> Vec<RunnerInfo> {
        self.inner
            .runners
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Decide whether a job may start and, if so, start it
    ///
    /// Serialized under the admission gate with a bounded wait; a gate
    /// timeout yields `UnknownError` rather than blocking indefinitely.
    pub async fn try_start_runner(
        &self,
        job: Job,
        revision: Arc<ConfigurationRevision>,
    ) -> AdmissionOutcome {
        let gate = tokio::time::timeout(
            self.inner.options.admission_wait,
            self.inner.admission.lock(),
        )
        .await;
        let outcome = match gate {
            Ok(_guard) => self.admit(job, revision).await,
            Err(_) => {
                warn!("Admission gate wait timed out");
                AdmissionOutcome::UnknownError
            }
        };
        counter!("fluxfile_node_admissions_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn admit(&self, mut job: Job, revision: Arc<ConfigurationRevision>) -> AdmissionOutcome {
        let inner = &self.inner;
        let uid = job.uid;

        // 1. Concurrency limit.
        if inner.runners.len() >= inner.node.max_runners {
            debug!(job = %uid, "At maximum runners");
            return AdmissionOutcome::AtMaximumRunners;
        }

        // 2. Pre-execution policy.
        if job.pre_check_required {
            if let Some(policy) = &inner.policy {
                match self.evaluate_policy(policy, &job).await {
                    PolicyDecision::Allow => {}
                    PolicyDecision::Reject => {
                        info!(job = %uid, "Rejected by pre-execute policy");
                        return AdmissionOutcome::PreCheckFailed;
                    }
                    PolicyDecision::Exit => {
                        warn!(job = %uid, "Pre-execute policy requested the node stop accepting work");
                        return AdmissionOutcome::PreCheckFailed;
                    }
                    PolicyDecision::Restart => {
                        if inner.node.containerized && inner.runners.is_empty() {
                            warn!("Pre-execute policy requested restart; node will terminate shortly");
                            let restart = Arc::clone(&inner.restart);
                            tokio::spawn(async move {
                                tokio::time::sleep(RESTART_DELAY).await;
                                restart();
                            });
                        } else {
                            warn!(job = %uid, "Restart decision ignored (not containerized or runners active)");
                        }
                        return AdmissionOutcome::PreCheckFailed;
                    }
                }
            }
        }

        // 3. Temp path must exist.
        if let Err(error) = std::fs::create_dir_all(&inner.node.temp_path) {
            error!(path = %inner.node.temp_path.display(), %error, "Failed to locate temp path");
            return AdmissionOutcome::FailedToLocateTempPath;
        }

        // 4. Flow resolution.
        let Some(flow) = job.flow_uid.and_then(|uid| revision.flow(uid)).cloned() else {
            info!(job = %uid, "Flow not found in configuration revision");
            return AdmissionOutcome::FlowNotFound;
        };

        // 5. Transition the working copy to Processing.
        job.begin_processing(&inner.node, &flow);

        // 6. Insert the runner, then get the coordinator's acknowledgment;
        //    roll back the insertion if it is refused.
        let weak = Arc::downgrade(inner);
        let on_complete: CompletionHook = Arc::new(move |uid| {
            if let Some(inner) = weak.upgrade() {
                inner.runners.remove(&uid);
                inner.broadcast();
                debug!(job = %uid, "Runner completed");
            }
        });
        let runner = Runner::new(
            job,
            Arc::clone(&inner.node),
            revision,
            Arc::clone(&inner.coordinator),
            inner.options.clone(),
            inner.server_url.clone(),
            inner.access_token.clone(),
            on_complete,
        );
        inner.runners.insert(uid, Arc::clone(&runner));

        let started = inner.coordinator.file_start_processing(&runner.job()).await;
        match started {
            Ok(true) => {}
            Ok(false) => {
                inner.runners.remove(&uid);
                info!(job = %uid, "Coordinator refused start processing");
                return AdmissionOutcome::CannotProcess;
            }
            Err(error) => {
                inner.runners.remove(&uid);
                warn!(job = %uid, %error, "Failed to notify coordinator of start");
                return AdmissionOutcome::CannotProcess;
            }
        }

        // 7. Start the runner, fire-and-forget relative to the caller.
        tokio::spawn(runner.run());
        inner.broadcast();
        info!(job = %uid, active = inner.runners.len(), "Runner started");
        AdmissionOutcome::CanProcess
    }

    async fn evaluate_policy(
        &self,
        policy: &Arc<dyn PreExecutePolicy>,
        job: &Job,
    ) -> PolicyDecision {
        let inner = &self.inner;
        let context = PolicyContext {
            node_uid: inner.node.uid,
            node_name: inner.node.name.clone(),
            job_uid: job.uid,
            job_name: job.name.clone(),
            active_runners: inner.runners.len(),
            variables: HashMap::new(),
        };

        match policy.evaluate(&context).await {
            Ok(decision) => decision,
            Err(error) => {
                warn!(job = %job.uid, %error, "Pre-execute policy evaluation failed");
                let message = format!("Pre-execute policy evaluation failed: {error}");
                if let Err(notify_error) = inner
                    .coordinator
                    .notify(Severity::Warning, &message)
                    .await
                {
                    debug!(%notify_error, "Failed to send policy warning notification");
                }
                PolicyDecision::Reject
            }
        }
    }

    /// Called by every runner exactly once; removal itself happens in the
    /// completion hook, this is the explicit variant for embedding shells.
    pub fn on_runner_completed(&self, uid: JobUid) {
        if self.inner.runners.remove(&uid).is_some() {
            self.inner.broadcast();
        }
    }

    /// Mark a runner aborted and push the cooperative abort notification
    pub async fn abort_runner(&self, uid: JobUid) -> bool {
        let runner = self.inner.runners.get(&uid).map(|r| r.value().clone());
        match runner {
            Some(runner) => {
                runner.abort().await;
                self.inner.broadcast();
                true
            }
            None => false,
        }
    }

    /// Abort every active runner
    pub async fn abort_all(&self) {
        let runners: Vec<Arc<Runner>> = self
            .inner
            .runners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for runner in runners {
            runner.abort().await;
        }
        self.inner.broadcast();
    }

    /// Merge a subprocess-reported progress snapshot into the matching
    /// active runner
    pub fn update_runner(&self, reported: RunnerInfo) -> bool {
        match self.inner.runners.get(&reported.job_uid) {
            Some(runner) => {
                runner.update_reported(&reported);
                true
            }
            None => false,
        }
    }
}
