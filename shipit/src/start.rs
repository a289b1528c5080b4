//! Orchestration for starting (or resuming) a run.
//!
//! A run is a single loop session identified by a stable `run_id` derived
//! from the originating issue or the task document. Starting a run creates
//! the `shipit/<run-id>` branch, seeds `.shipit/` (ignore rules, default
//! config, persisted state), and commits the bootstrap. Re-running with the
//! same id resumes the persisted state; a different id resets it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::core::types::TaskSpec;
use crate::io::config::{ShipitConfig, load_config, write_config};
use crate::io::git::Git;
use crate::io::host::HostApi;
use crate::io::state::{FileStore, LoopState, StateStore};

/// Where the task text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSource {
    /// Fetch title/body/discussion from a tracked issue.
    Issue(u64),
    /// Read a local markdown document (first line is the title).
    File(PathBuf),
}

/// Outcome of run bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub run_id: String,
    pub branch: String,
    pub base: String,
}

/// Start (or resume) a run in `root`.
pub fn start_run<H: HostApi>(root: &Path, host: &H, source: &TaskSource) -> Result<StartOutcome> {
    debug!(root = %root.display(), "starting run");
    let git = Git::new(root);

    // Refuse to bootstrap over unrelated local work; `.shipit/` changes are ours.
    git.ensure_clean_except_prefixes(&[".shipit/"])?;

    let (run_id, task, request) = match source {
        TaskSource::Issue(number) => {
            let issue = host
                .issue(*number)
                .with_context(|| format!("fetch issue #{number}"))?;
            (
                format!("issue-{number}"),
                TaskSpec {
                    title: issue.title,
                    description: issue.body,
                    discussion: issue.discussion,
                },
                Some(*number),
            )
        }
        TaskSource::File(path) => {
            let task = read_task_file(path)?;
            (format!("task-{}", git.head_short_sha(8)?), task, None)
        }
    };
    validate_id(&run_id)?;

    let branch = format!("shipit/{run_id}");
    let current = git.current_branch()?;
    if current != branch {
        if git.branch_exists(&branch)? {
            debug!(branch = %branch, "checking out existing run branch");
            git.checkout_branch(&branch)
                .with_context(|| format!("checkout existing branch {branch}"))?;
        } else {
            info!(branch = %branch, "creating run branch");
            git.checkout_new_branch(&branch)
                .with_context(|| format!("create branch {branch}"))?;
        }
    }

    let shipit_dir = root.join(".shipit");
    ensure_state_gitignore(&shipit_dir.join(".gitignore"))?;
    let config_path = shipit_dir.join("config.toml");
    if !config_path.exists() {
        write_config(&config_path, &ShipitConfig::default())?;
    }
    let cfg = load_config(&config_path)?;
    let base = if cfg.base_branch.is_empty() {
        host.default_branch().context("resolve default branch")?
    } else {
        cfg.base_branch.clone()
    };

    let store = FileStore::new(root);
    let mut state = store.load()?;
    // A different persisted run id means stale state from another run.
    if state.run_id.as_deref() != Some(run_id.as_str()) {
        state = LoopState {
            run_id: Some(run_id.clone()),
            task: Some(task),
            request,
            ..LoopState::default()
        };
    }
    store.save(&state)?;

    git.add_all()?;
    let _committed = git.commit_staged(&format!("chore(shipit): start run {run_id}"))?;

    info!(run_id = %run_id, branch = %branch, base = %base, "run started");
    Ok(StartOutcome {
        run_id,
        branch,
        base,
    })
}

/// Parse a local task document: first non-blank line is the title, the rest
/// is the description.
fn read_task_file(path: &Path) -> Result<TaskSpec> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task file {}", path.display()))?;
    let trimmed = contents.trim_start();
    let (first, rest) = trimmed.split_once('\n').unwrap_or((trimmed, ""));
    let title = first.trim_start_matches('#').trim().to_string();
    if title.is_empty() {
        return Err(anyhow!("task file {} is empty", path.display()));
    }
    Ok(TaskSpec {
        title,
        description: rest.trim().to_string(),
        discussion: String::new(),
    })
}

/// Validate that an id is safe for use in `shipit/<id>` branch names.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("run id must not be empty"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("run id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

/// State artifacts must never travel with the branch.
fn ensure_state_gitignore(path: &Path) -> Result<()> {
    const REQUIRED_LINES: [&str; 2] = ["iterations/", "state.json"];

    let mut existing = String::new();
    if path.exists() {
        existing = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    }

    let mut lines: Vec<String> = existing
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    for req in REQUIRED_LINES {
        if !lines.iter().any(|l| l == req) {
            lines.push(req.to_string());
        }
    }

    // Stable ordering.
    lines.sort();
    lines.dedup();

    let mut out = lines.join("\n");
    out.push('\n');

    if out != existing {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(path, out).with_context(|| format!("write {}", path.display()))?;
    }

    Ok(())
}
