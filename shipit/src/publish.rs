//! Push/fallback protocol for publishing the work branch.
//!
//! A direct push is attempted first. When the remote refuses it and the
//! refusal involves protected paths, the protocol posts those changes as a
//! patch comment on the originating request, strips them back to their
//! base-branch state, and retries once. The caller always gets the
//! tri-state [`PublishOutcome`]; whatever goes wrong inside folds into
//! `Failure` so the loop can absorb it as a forced revise instead of
//! crashing.

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::git::Git;
use crate::io::host::HostApi;

/// Hidden marker keying the idempotent patch comment.
pub const PATCH_COMMENT_MARKER: &str = "<!-- shipit:protected-patch -->";

/// Result of one publish attempt.
///
/// `Success` and `AlreadyUpToDate` are both "published" for control-flow
/// purposes; they stay distinguishable for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The branch tip is now on the remote.
    Success,
    /// Local and remote tips were already identical; nothing to do.
    AlreadyUpToDate,
    /// The branch could not be published.
    Failure(String),
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        !matches!(self, PublishOutcome::Failure(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            PublishOutcome::Success => "success",
            PublishOutcome::AlreadyUpToDate => "already-up-to-date",
            PublishOutcome::Failure(_) => "failure",
        }
    }
}

/// Inputs for a publish attempt.
#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    pub branch: &'a str,
    pub base: &'a str,
    /// Originating tracked item for the patch comment; `None` disables the
    /// protected-path fallback.
    pub request: Option<u64>,
    pub protected_paths: &'a [String],
}

/// Publish `branch`, falling back to the protected-path protocol on refusal.
#[instrument(skip_all, fields(branch = request.branch))]
pub fn publish<H: HostApi>(git: &Git, host: &H, request: &PublishRequest<'_>) -> PublishOutcome {
    match try_publish(git, host, request) {
        Ok(outcome) => outcome,
        Err(err) => PublishOutcome::Failure(format!("{err:#}")),
    }
}

fn try_publish<H: HostApi>(
    git: &Git,
    host: &H,
    request: &PublishRequest<'_>,
) -> Result<PublishOutcome> {
    let local = git.rev_parse(request.branch)?;
    if let Some(remote) = git.remote_tip(request.branch)?
        && remote == local
    {
        debug!("branch already up to date");
        return Ok(PublishOutcome::AlreadyUpToDate);
    }

    let Some(reason) = git.push_branch(request.branch)? else {
        info!("branch pushed");
        return Ok(PublishOutcome::Success);
    };
    warn!(reason = %reason, "direct push rejected");

    let protected = protected_changes(git, request)?;
    if protected.is_empty() {
        return Ok(PublishOutcome::Failure(reason));
    }
    let Some(item) = request.request else {
        return Ok(PublishOutcome::Failure(format!(
            "push rejected with protected-path changes but no tracked item to post the patch on: {reason}"
        )));
    };

    let range = format!("{}...{}", request.base, request.branch);
    let patch = git.diff_patch(&range, &protected)?;
    // Post the patch before stripping: never destroy changes a human cannot
    // retrieve.
    host.upsert_comment(item, PATCH_COMMENT_MARKER, &render_patch_comment(&protected, &patch))
        .context("post patch comment")?;
    info!(paths = protected.len(), "protected-path patch posted");

    strip_protected(git, request, &protected, item)?;

    match git.push_branch(request.branch)? {
        None => {
            info!("branch pushed after stripping protected paths");
            Ok(PublishOutcome::Success)
        }
        Some(retry_reason) => Ok(PublishOutcome::Failure(retry_reason)),
    }
}

/// Changed paths on the branch that fall under a protected prefix.
fn protected_changes(git: &Git, request: &PublishRequest<'_>) -> Result<Vec<String>> {
    let range = format!("{}...{}", request.base, request.branch);
    let changed = git.diff_name_only(&range)?;
    Ok(changed
        .into_iter()
        .filter(|path| {
            request
                .protected_paths
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
        })
        .collect())
}

/// Rewind protected paths to their base-branch state: restore pre-existing
/// files, delete newly added ones, and commit the strip as one commit.
fn strip_protected(
    git: &Git,
    request: &PublishRequest<'_>,
    protected: &[String],
    item: u64,
) -> Result<()> {
    for path in protected {
        if git.path_in_ref(request.base, path)? {
            git.checkout_path_from(request.base, path)?;
        } else {
            git.remove_path(path)?;
        }
    }
    let message =
        format!("chore: drop protected-path changes (patch posted on #{item})");
    if !git.commit_staged(&message)? {
        return Err(anyhow!("expected protected-path strip to stage changes"));
    }
    debug!("protected paths stripped");
    Ok(())
}

fn render_patch_comment(protected: &[String], patch: &str) -> String {
    let mut body = String::new();
    body.push_str(PATCH_COMMENT_MARKER);
    body.push_str("\n## Protected-path changes\n\n");
    body.push_str(
        "This automation's identity cannot push changes under the paths below. \
         Apply the patch manually if they are wanted.\n\n",
    );
    for path in protected {
        body.push_str(&format!("- `{path}`\n"));
    }
    body.push_str("\n```diff\n");
    body.push_str(patch.trim_end());
    body.push_str("\n```\n");
    body
}
