//! Test-only helpers: a git repo with a bare origin, scripted agents, a
//! scripted host, and an in-memory state store.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};

use crate::io::agents::{AgentRequest, AgentRunner};
use crate::io::git::Git;
use crate::io::host::{HostApi, IssueInfo, RequestInfo};
use crate::io::state::{LoopState, StateStore};

/// A working repository with one commit on `main` and a bare `origin`.
pub struct TestRepo {
    temp: tempfile::TempDir,
    root: PathBuf,
    remote: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let root = temp.path().join("work");
        let remote = temp.path().join("origin.git");
        fs::create_dir_all(&root).context("create workdir")?;

        run(temp.path(), "git", &["init", "--bare", "origin.git"])?;
        run(&root, "git", &["init", "-b", "main"])?;
        run(&root, "git", &["config", "user.email", "test@example.com"])?;
        run(&root, "git", &["config", "user.name", "test"])?;
        fs::write(root.join("README.md"), "hi\n").context("write README")?;
        run(&root, "git", &["add", "README.md"])?;
        run(&root, "git", &["commit", "-m", "chore: init"])?;
        let remote_spec = remote.to_string_lossy().to_string();
        run(&root, "git", &["remote", "add", "origin", &remote_spec])?;
        run(&root, "git", &["push", "-u", "origin", "main"])?;

        Ok(Self { temp, root, remote })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch space outside the repository (for task files etc.).
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    pub fn git(&self) -> Git {
        Git::new(&self.root)
    }

    /// Write a file and commit it on the current branch.
    pub fn commit_file(&self, path: &str, contents: &str, message: &str) -> Result<()> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&full, contents).with_context(|| format!("write {}", full.display()))?;
        run(&self.root, "git", &["add", "-A"])?;
        run(&self.root, "git", &["commit", "-m", message])?;
        Ok(())
    }

    pub fn remove_remote(&self) -> Result<()> {
        run(&self.root, "git", &["remote", "remove", "origin"])?;
        Ok(())
    }

    /// Commit message of the given revision.
    pub fn commit_message(&self, rev: &str) -> Result<String> {
        run(&self.root, "git", &["log", "-1", "--pretty=%B", rev])
    }

    pub fn last_commit_message(&self) -> Result<String> {
        self.commit_message("HEAD")
    }

    /// Tip of a branch as the bare origin sees it.
    pub fn remote_branch_tip(&self, branch: &str) -> Result<Option<String>> {
        let refspec = format!("refs/heads/{branch}");
        let out = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &refspec])
            .current_dir(&self.remote)
            .output()
            .context("spawn git rev-parse in origin")?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Install a pre-receive hook on the origin that refuses any push whose
    /// changed files fall under `prefix`, mimicking a restricted identity.
    pub fn install_protected_hook(&self, prefix: &str) -> Result<()> {
        let hooks = self.remote.join("hooks");
        fs::create_dir_all(&hooks).context("create hooks dir")?;
        let script = format!(
            "#!/bin/sh\n\
             zero=\"0000000000000000000000000000000000000000\"\n\
             while read old new ref; do\n\
             \t[ \"$new\" = \"$zero\" ] && continue\n\
             \tif [ \"$old\" = \"$zero\" ]; then\n\
             \t\tif git rev-parse --verify --quiet refs/heads/main >/dev/null; then\n\
             \t\t\tfiles=$(git diff --name-only main \"$new\")\n\
             \t\telse\n\
             \t\t\tfiles=$(git ls-tree -r --name-only \"$new\")\n\
             \t\tfi\n\
             \telse\n\
             \t\tfiles=$(git diff --name-only \"$old\" \"$new\")\n\
             \tfi\n\
             \tif printf '%s\\n' \"$files\" | grep -q \"^{prefix}\"; then\n\
             \t\techo \"protected path update refused\" >&2\n\
             \t\texit 1\n\
             \tfi\n\
             done\n\
             exit 0\n"
        );
        let hook_path = hooks.join("pre-receive");
        fs::write(&hook_path, script).context("write pre-receive hook")?;
        let mut perms = fs::metadata(&hook_path).context("hook metadata")?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&hook_path, perms).context("chmod hook")?;
        Ok(())
    }
}

fn run(dir: &Path, program: &str, args: &[&str]) -> Result<String> {
    let out = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn {program} {}", args.join(" ")))?;
    if !out.status.success() {
        return Err(anyhow!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// One scripted agent invocation.
pub struct ScriptedStep {
    /// Output document written to the requested output path.
    pub output: serde_json::Value,
    /// Relative path + contents written into the workdir first, simulating
    /// an edit. `None` simulates an agent that changed nothing.
    pub write_file: Option<(String, String)>,
}

/// Agent double that replays scripted steps without spawning processes.
pub struct ScriptedAgent {
    steps: RefCell<VecDeque<ScriptedStep>>,
    /// Prompts received, in invocation order.
    pub prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: RefCell::new(steps.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Steps not yet consumed.
    pub fn remaining(&self) -> usize {
        self.steps.borrow().len()
    }

    /// Number of times the agent was invoked.
    pub fn invocations(&self) -> usize {
        self.prompts.borrow().len()
    }
}

impl AgentRunner for ScriptedAgent {
    fn exec(&self, request: &AgentRequest) -> Result<()> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        let step = self
            .steps
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no steps left"))?;
        if let Some((path, contents)) = &step.write_file {
            let full = request.workdir.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&full, contents)?;
        }
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut buf = serde_json::to_string_pretty(&step.output)?;
        buf.push('\n');
        fs::write(&request.output_path, buf)?;
        Ok(())
    }
}

/// Agent double whose process "crashes" on every invocation.
pub struct FailingAgent;

impl AgentRunner for FailingAgent {
    fn exec(&self, _request: &AgentRequest) -> Result<()> {
        Err(anyhow!("agent crashed"))
    }
}

/// Host double recording every call.
pub struct ScriptedHost {
    pub default_branch: String,
    pub issue: IssueInfo,
    pub open_request: RefCell<Option<RequestInfo>>,
    pub created: RefCell<Vec<RequestInfo>>,
    pub updated_titles: RefCell<Vec<(u64, String)>>,
    /// (item number, body) pairs; upserts replace in place like the real host.
    pub comments: RefCell<Vec<(u64, String)>>,
    pub closed: RefCell<Vec<(u64, String)>>,
    fail_comments: bool,
    next_number: Cell<u64>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self {
            default_branch: "main".to_string(),
            issue: IssueInfo {
                title: "Scripted task".to_string(),
                body: "Do the scripted thing.".to_string(),
                discussion: String::new(),
            },
            open_request: RefCell::new(None),
            created: RefCell::new(Vec::new()),
            updated_titles: RefCell::new(Vec::new()),
            comments: RefCell::new(Vec::new()),
            closed: RefCell::new(Vec::new()),
            fail_comments: false,
            next_number: Cell::new(100),
        }
    }

    /// Variant whose comment endpoint always errors.
    pub fn failing_comments(mut self) -> Self {
        self.fail_comments = true;
        self
    }
}

impl Default for ScriptedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostApi for ScriptedHost {
    fn default_branch(&self) -> Result<String> {
        Ok(self.default_branch.clone())
    }

    fn issue(&self, _number: u64) -> Result<IssueInfo> {
        Ok(self.issue.clone())
    }

    fn find_open_request(&self, _branch: &str) -> Result<Option<RequestInfo>> {
        Ok(self.open_request.borrow().clone())
    }

    fn create_request(
        &self,
        _branch: &str,
        _base: &str,
        _title: &str,
        _body: &str,
    ) -> Result<RequestInfo> {
        let number = self.next_number.get();
        self.next_number.set(number + 1);
        let info = RequestInfo {
            number,
            url: format!("https://example.test/pull/{number}"),
        };
        self.open_request.replace(Some(info.clone()));
        self.created.borrow_mut().push(info.clone());
        Ok(info)
    }

    fn update_request_title(&self, number: u64, title: &str) -> Result<()> {
        self.updated_titles
            .borrow_mut()
            .push((number, title.to_string()));
        Ok(())
    }

    fn upsert_comment(&self, number: u64, marker: &str, body: &str) -> Result<()> {
        if self.fail_comments {
            return Err(anyhow!("comment endpoint unavailable"));
        }
        let mut comments = self.comments.borrow_mut();
        if let Some(existing) = comments
            .iter_mut()
            .find(|(n, b)| *n == number && b.contains(marker))
        {
            existing.1 = body.to_string();
        } else {
            comments.push((number, body.to_string()));
        }
        Ok(())
    }

    fn close_with_comment(&self, number: u64, comment: &str) -> Result<()> {
        self.closed.borrow_mut().push((number, comment.to_string()));
        Ok(())
    }
}

/// In-memory state store for tests.
pub struct MemoryStore {
    state: RefCell<LoopState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(LoopState::default()),
        }
    }

    pub fn with_state(state: LoopState) -> Self {
        Self {
            state: RefCell::new(state),
        }
    }

    pub fn snapshot(&self) -> LoopState {
        self.state.borrow().clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<LoopState> {
        Ok(self.state.borrow().clone())
    }

    fn save(&self, state: &LoopState) -> Result<()> {
        *self.state.borrow_mut() = state.clone();
        Ok(())
    }
}
