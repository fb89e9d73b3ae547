//! Flow definitions and the configuration revision that carries them
//!
//! A configuration revision is an externally supplied, versioned snapshot
//! of the flow definitions and system scripts a node needs to run jobs.
//! It is read-only from the runtime's perspective.

use crate::utils::errors::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use ulid::Ulid;

/// A flow definition (the pipeline a job executes)
///
/// The step graph itself is interpreted by the subprocess; the runtime only
/// needs identity and per-flow execution options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Flow {
    pub uid: Ulid,
    pub name: String,
    /// Mirror the run log to the coordinator incrementally while running
    #[serde(default)]
    pub debug_logging: bool,
}

/// A system script shipped with the revision (e.g. a pre-execute policy script)
#[derive(Debug, Clone)]
pub struct SystemScript {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RevisionManifest {
    revision: i64,
    #[serde(default)]
    flows: Vec<Flow>,
}

/// Versioned snapshot of flows and system scripts
#[derive(Debug)]
pub struct ConfigurationRevision {
    revision: i64,
    path: PathBuf,
    flows: HashMap<Ulid, Flow>,
    scripts: HashMap<String, SystemScript>,
}

impl ConfigurationRevision {
    /// Create an empty revision rooted at a path
    pub fn new(revision: i64, path: impl Into<PathBuf>) -> Self {
        Self {
            revision,
            path: path.into(),
            flows: HashMap::new(),
            scripts: HashMap::new(),
        }
    }

    /// Load a revision directory: `revision.yaml` plus an optional `scripts/` directory
    pub fn load(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join("revision.yaml");
        let raw = std::fs::read_to_string(&manifest_path)?;
        let manifest: RevisionManifest = serde_yaml::from_str(&raw)?;

        let mut revision = Self::new(manifest.revision, dir);
        for flow in manifest.flows {
            revision.flows.insert(flow.uid, flow);
        }

        let scripts_dir = dir.join("scripts");
        if scripts_dir.is_dir() {
            for entry in std::fs::read_dir(&scripts_dir)? {
                let entry = entry?;
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                revision.scripts.insert(
                    name.to_string(),
                    SystemScript {
                        name: name.to_string(),
                        path,
                    },
                );
            }
        }

        debug!(
            revision = revision.revision,
            flows = revision.flows.len(),
            scripts = revision.scripts.len(),
            "Loaded configuration revision"
        );
        Ok(revision)
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    /// Path of the revision on disk, passed to subprocesses
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a flow by UID
    pub fn flow(&self, uid: Ulid) -> Option<&Flow> {
        self.flows.get(&uid)
    }

    /// Look up a system script by name
    pub fn system_script(&self, name: &str) -> Option<&SystemScript> {
        self.scripts.get(name)
    }

    /// Register a flow (used when assembling a revision in memory)
    pub fn with_flow(mut self, flow: Flow) -> Self {
        self.flows.insert(flow.uid, flow);
        self
    }

    /// Register a system script
    pub fn with_script(mut self, script: SystemScript) -> Self {
        self.scripts.insert(script.name.clone(), script);
        self
    }
}
