//! Iteration artifacts under `.shipit/iterations/`.
//!
//! Product output, always written regardless of `RUST_LOG`. The directory is
//! ignore-listed so artifacts never travel with the branch.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::verdict::Verdict;

/// Metadata for one completed iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub iter: u32,
    /// `None` on the soft no-commit path (the reviewer never ran).
    pub verdict: Option<Verdict>,
    /// Whether the iteration produced new commits.
    pub committed: bool,
    /// Publish outcome label (`success`, `already-up-to-date`, `failure`).
    pub publish: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Resolved paths for one iteration's artifacts.
#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub edit_schema_path: PathBuf,
    pub edit_output_path: PathBuf,
    pub edit_log_path: PathBuf,
    pub review_schema_path: PathBuf,
    pub review_output_path: PathBuf,
    pub review_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(root: &Path, run_id: &str, iter: u32) -> Self {
        let dir = root
            .join(".shipit")
            .join("iterations")
            .join(run_id)
            .join(iter.to_string());
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            edit_schema_path: dir.join("edit_output.schema.json"),
            edit_output_path: dir.join("edit_output.json"),
            edit_log_path: dir.join("editor.log"),
            review_schema_path: dir.join("review_output.schema.json"),
            review_output_path: dir.join("review_output.json"),
            review_log_path: dir.join("reviewer.log"),
        }
    }
}

/// Write the iteration metadata document.
pub fn write_meta(paths: &IterationPaths, meta: &IterationMeta) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    fs::write(&paths.meta_path, buf)
        .with_context(|| format!("write {}", paths.meta_path.display()))
}
