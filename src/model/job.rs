//! Job record and processing status
//!
//! The coordinator owns the durable job; the runtime holds a working copy
//! for the duration of execution and returns the final copy on completion.
//! Status codes are stable integers because the subprocess may report its
//! terminal state through its raw exit code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Job UID, assigned by the coordinator
pub type JobUid = Ulid;

/// Processing status of a job
///
/// The integer codes double as subprocess exit codes, so they are part of
/// the exit contract and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum JobStatus {
    Unprocessed = 0,
    Processed = 1,
    Processing = 2,
    ProcessingFailed = 3,
    Duplicate = 4,
    MappingIssue = 5,
    OnHold = 6,
    Disabled = 7,
    OutOfSchedule = 8,
}

impl JobStatus {
    /// All defined statuses, in code order
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Unprocessed,
        JobStatus::Processed,
        JobStatus::Processing,
        JobStatus::ProcessingFailed,
        JobStatus::Duplicate,
        JobStatus::MappingIssue,
        JobStatus::OnHold,
        JobStatus::Disabled,
        JobStatus::OutOfSchedule,
    ];

    /// Map an integer code to a status, if it is a defined value
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// The stable integer code for this status
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<JobStatus> for i32 {
    fn from(status: JobStatus) -> Self {
        status.code()
    }
}

impl TryFrom<i32> for JobStatus {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        JobStatus::from_code(code).ok_or_else(|| format!("Invalid job status code {code}"))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Unprocessed => "Unprocessed",
            JobStatus::Processed => "Processed",
            JobStatus::Processing => "Processing",
            JobStatus::ProcessingFailed => "ProcessingFailed",
            JobStatus::Duplicate => "Duplicate",
            JobStatus::MappingIssue => "MappingIssue",
            JobStatus::OnHold => "OnHold",
            JobStatus::Disabled => "Disabled",
            JobStatus::OutOfSchedule => "OutOfSchedule",
        };
        f.write_str(name)
    }
}

/// A pipeline step the subprocess reports having executed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutedStep {
    pub step_name: String,
    pub elapsed_seconds: f64,
    pub successful: bool,
}

/// Working copy of a library file job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Job {
    /// Identity, assigned by the coordinator
    pub uid: JobUid,

    /// File name
    pub name: String,

    /// Path relative to the source library
    pub relative_path: String,

    pub status: JobStatus,

    /// Human-readable reason for a terminal failure
    pub failure_reason: Option<String>,

    /// Size of the source file in bytes
    pub original_size: u64,

    /// Assigned flow
    pub flow_uid: Option<Ulid>,
    pub flow_name: String,

    /// Assigned node, stamped at admission
    pub node_uid: Option<Ulid>,
    pub node_name: String,

    /// Per-attempt fields, cleared at admission
    pub display_name: Option<String>,
    pub reprocessing: bool,
    pub executed_steps: Vec<ExecutedStep>,

    pub processing_started: Option<DateTime<Utc>>,
    pub processing_ended: Option<DateTime<Utc>>,

    /// Whether admission must evaluate the node's pre-execute policy
    pub pre_check_required: bool,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            uid: Ulid::nil(),
            name: String::new(),
            relative_path: String::new(),
            status: JobStatus::Unprocessed,
            failure_reason: None,
            original_size: 0,
            flow_uid: None,
            flow_name: String::new(),
            node_uid: None,
            node_name: String::new(),
            display_name: None,
            reprocessing: false,
            executed_steps: Vec::new(),
            processing_started: None,
            processing_ended: None,
            pre_check_required: true,
        }
    }
}

impl Job {
    /// Create an unprocessed job for a source file
    pub fn new(name: impl Into<String>, relative_path: impl Into<String>, flow_uid: Ulid) -> Self {
        Self {
            uid: Ulid::new(),
            name: name.into(),
            relative_path: relative_path.into(),
            flow_uid: Some(flow_uid),
            ..Default::default()
        }
    }

    /// Transition to Processing at admission: clear per-attempt fields and
    /// stamp the assigned node and flow
    pub fn begin_processing(&mut self, node: &crate::model::node::Node, flow: &crate::model::flow::Flow) {
        self.status = JobStatus::Processing;
        self.failure_reason = None;
        self.executed_steps.clear();
        self.display_name = None;
        self.reprocessing = false;
        self.node_uid = Some(node.uid);
        self.node_name = node.name.clone();
        self.flow_uid = Some(flow.uid);
        self.flow_name = flow.name.clone();
        self.processing_started = Some(Utc::now());
        self.processing_ended = None;
    }

    /// Mark the job failed with a reason
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::ProcessingFailed;
        self.failure_reason = Some(reason.into());
    }
}
