//! Issue/PR host adapter backed by the GitHub CLI.
//!
//! All host traffic goes through `gh` subprocess calls so the automation
//! inherits whatever identity the environment provides (`GH_TOKEN` or an
//! existing login). The [`HostApi`] trait keeps everything above this module
//! testable without a network.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument};

/// An open review request for a branch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RequestInfo {
    pub number: u64,
    pub url: String,
}

/// Task text fetched from a tracked issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueInfo {
    pub title: String,
    pub body: String,
    /// Comment bodies joined in thread order.
    pub discussion: String,
}

/// Host operations the loop consumes.
pub trait HostApi {
    /// Name of the repository's default branch.
    fn default_branch(&self) -> Result<String>;
    /// Title, body, and discussion of a tracked issue.
    fn issue(&self, number: u64) -> Result<IssueInfo>;
    /// Find an open review request whose head is `branch`.
    fn find_open_request(&self, branch: &str) -> Result<Option<RequestInfo>>;
    /// Open a review request for `branch` onto `base`.
    fn create_request(&self, branch: &str, base: &str, title: &str, body: &str)
    -> Result<RequestInfo>;
    /// Update the title of an existing review request.
    fn update_request_title(&self, number: u64, title: &str) -> Result<()>;
    /// Create or update (idempotently, keyed by `marker`) a comment on a
    /// tracked item.
    fn upsert_comment(&self, number: u64, marker: &str, body: &str) -> Result<()>;
    /// Close a tracked item with a closing comment.
    fn close_with_comment(&self, number: u64, comment: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    comments: Vec<CommentPayload>,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct ApiComment {
    id: u64,
    #[serde(default)]
    body: String,
}

/// Host adapter that shells out to the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GhHost {
    workdir: PathBuf,
}

impl GhHost {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("gh {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("gh")
            .args(args)
            .current_dir(&self.workdir)
            .env("GH_NO_UPDATE_NOTIFIER", "1")
            .output()
            .with_context(|| format!("spawn gh {}", args.join(" ")))
    }
}

impl HostApi for GhHost {
    fn default_branch(&self) -> Result<String> {
        let out = self.run_capture(&[
            "repo",
            "view",
            "--json",
            "defaultBranchRef",
            "--jq",
            ".defaultBranchRef.name",
        ])?;
        let name = out.trim().to_string();
        if name.is_empty() {
            return Err(anyhow!("host reported an empty default branch"));
        }
        debug!(branch = %name, "default branch");
        Ok(name)
    }

    fn issue(&self, number: u64) -> Result<IssueInfo> {
        let number_arg = number.to_string();
        let raw = self.run_capture(&[
            "issue",
            "view",
            &number_arg,
            "--json",
            "title,body,comments",
        ])?;
        let payload: IssuePayload =
            serde_json::from_str(&raw).with_context(|| format!("parse issue #{number}"))?;
        let discussion = payload
            .comments
            .iter()
            .map(|c| c.body.trim())
            .filter(|b| !b.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(IssueInfo {
            title: payload.title,
            body: payload.body,
            discussion,
        })
    }

    fn find_open_request(&self, branch: &str) -> Result<Option<RequestInfo>> {
        let raw = self.run_capture(&[
            "pr",
            "list",
            "--head",
            branch,
            "--state",
            "open",
            "--json",
            "number,url",
        ])?;
        let mut requests: Vec<RequestInfo> =
            serde_json::from_str(raw.trim()).context("parse open request list")?;
        Ok(if requests.is_empty() {
            None
        } else {
            Some(requests.remove(0))
        })
    }

    #[instrument(skip_all, fields(branch, base))]
    fn create_request(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<RequestInfo> {
        self.run_checked(&[
            "pr", "create", "--head", branch, "--base", base, "--title", title, "--body", body,
        ])?;
        // `pr create` prints a URL; re-query for the structured record.
        let created = self
            .find_open_request(branch)?
            .ok_or_else(|| anyhow!("created request for {branch} but cannot find it"))?;
        info!(number = created.number, "review request opened");
        Ok(created)
    }

    fn update_request_title(&self, number: u64, title: &str) -> Result<()> {
        let number_arg = number.to_string();
        self.run_checked(&["pr", "edit", &number_arg, "--title", title])?;
        debug!(number, "review request title updated");
        Ok(())
    }

    fn upsert_comment(&self, number: u64, marker: &str, body: &str) -> Result<()> {
        let list_path = format!("repos/{{owner}}/{{repo}}/issues/{number}/comments");
        let raw = self.run_capture(&["api", &list_path])?;
        let comments: Vec<ApiComment> =
            serde_json::from_str(raw.trim()).context("parse comment list")?;
        let body_arg = format!("body={body}");

        if let Some(existing) = comments.iter().find(|c| c.body.contains(marker)) {
            let patch_path = format!("repos/{{owner}}/{{repo}}/issues/comments/{}", existing.id);
            self.run_checked(&["api", "-X", "PATCH", &patch_path, "-f", &body_arg])?;
            debug!(number, comment_id = existing.id, "comment updated");
            return Ok(());
        }

        self.run_checked(&["api", "-X", "POST", &list_path, "-f", &body_arg])?;
        debug!(number, "comment created");
        Ok(())
    }

    fn close_with_comment(&self, number: u64, comment: &str) -> Result<()> {
        let number_arg = number.to_string();
        self.run_checked(&["issue", "close", &number_arg, "--comment", comment])?;
        info!(number, "issue closed");
        Ok(())
    }
}
