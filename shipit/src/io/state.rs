//! Persistent loop state (`.shipit/state.json`).
//!
//! Every other component reads or writes through this store, so the schema
//! is one typed struct persisted as a whole-value overwrite. Loading a
//! missing file yields documented defaults; the store never blocks the loop
//! on absent state. Entries survive process restarts within the same
//! working tree but are ignore-listed so they are never part of a commit or
//! push.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{FinalStatus, MergeRecord, TaskSpec};
use crate::core::verdict::Verdict;

/// All state persisted for one run.
///
/// Field ownership is a contract, not enforced by types: the loop controller
/// owns `iteration` and `final_status`; the reviewing agent's results land
/// in `verdict` and `feedback`; the publish protocol owns `push_error`; the
/// merge resolver owns `merge_record`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopState {
    /// Stable identifier tying persisted state to its run branch.
    pub run_id: Option<String>,
    /// Immutable task description; `None` until the run is bootstrapped.
    pub task: Option<TaskSpec>,
    /// Originating tracked item (issue) number, when the task came from one.
    pub request: Option<u64>,
    /// Completed-iteration counter; 0 before the first cycle.
    pub iteration: u32,
    /// Normalized verdict from the most recent review.
    pub verdict: Verdict,
    /// Feedback consumed by the next editing-agent invocation.
    pub feedback: String,
    /// Reason the last publish attempt failed; empty once the branch pushed.
    pub push_error: String,
    /// Terminal state, written exactly once per run.
    pub final_status: Option<FinalStatus>,
    /// Merge record produced on the terminal SHIP path.
    pub merge_record: Option<MergeRecord>,
}

/// Injected persistence seam for [`LoopState`].
///
/// Production uses [`FileStore`]; tests substitute an in-memory store.
pub trait StateStore {
    fn load(&self) -> Result<LoopState>;
    fn save(&self, state: &LoopState) -> Result<()>;
}

/// File-backed store holding the whole state as one JSON document.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(".shipit").join("state.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStore {
    fn load(&self) -> Result<LoopState> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no persisted state, using defaults");
            return Ok(LoopState::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read state {}", self.path.display()))?;
        let state: LoopState = serde_json::from_str(&contents)
            .with_context(|| format!("parse state {}", self.path.display()))?;
        debug!(run_id = ?state.run_id, iteration = state.iteration, "state loaded");
        Ok(state)
    }

    /// Atomically overwrite the state on disk (temp file + rename).
    fn save(&self, state: &LoopState) -> Result<()> {
        debug!(path = %self.path.display(), iteration = state.iteration, "writing state");
        let mut buf = serde_json::to_string_pretty(state)?;
        buf.push('\n');
        let parent = self
            .path
            .parent()
            .with_context(|| format!("state path missing parent {}", self.path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &buf)
            .with_context(|| format!("write temp state {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace state {}", self.path.display()))?;
        Ok(())
    }
}
