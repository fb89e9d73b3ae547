//! Data model shared with the coordinator and the job subprocess
//!
//! - **job**: the library file working copy and its status codes
//! - **flow**: flow definitions and the configuration revision
//! - **node**: the executing machine's descriptor

pub mod flow;
pub mod job;
pub mod node;

pub use flow::{ConfigurationRevision, Flow, SystemScript};
pub use job::{ExecutedStep, Job, JobStatus, JobUid};
pub use node::Node;
