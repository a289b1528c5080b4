//! Merge strategy resolution for a terminal SHIP verdict.
//!
//! Two strategies: open/update a review request (default), or squash-publish
//! straight onto the base branch. Direct publish falls back to the
//! review-request path on any failure so a SHIP verdict never results in
//! lost work; only a failure of the fallback itself propagates.

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::types::{MergeRecord, MergeStrategy};
use crate::io::git::Git;
use crate::io::host::HostApi;

/// Inputs for merge resolution.
#[derive(Debug, Clone)]
pub struct MergeContext<'a> {
    pub branch: &'a str,
    pub base: &'a str,
    /// Originating tracked item, closed on direct publish.
    pub request: Option<u64>,
    /// Title for the review request or the squash commit.
    pub title: &'a str,
    /// Body for a newly opened review request.
    pub body: &'a str,
}

/// Resolve the configured strategy into a merge record.
#[instrument(skip_all, fields(branch = ctx.branch, strategy = ?strategy))]
pub fn resolve<H: HostApi>(
    strategy: MergeStrategy,
    git: &Git,
    host: &H,
    ctx: &MergeContext<'_>,
) -> Result<MergeRecord> {
    match strategy {
        MergeStrategy::ReviewRequest => open_or_update_request(host, ctx),
        MergeStrategy::DirectPublish => match direct_publish(git, host, ctx) {
            Ok(record) => Ok(record),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "direct publish failed, falling back to review request");
                open_or_update_request(host, ctx)
            }
        },
    }
}

fn open_or_update_request<H: HostApi>(host: &H, ctx: &MergeContext<'_>) -> Result<MergeRecord> {
    if let Some(existing) = host.find_open_request(ctx.branch)? {
        host.update_request_title(existing.number, ctx.title)?;
        info!(number = existing.number, "review request updated");
        return Ok(MergeRecord::ReviewRequest {
            number: existing.number,
            url: existing.url,
        });
    }
    let created = host
        .create_request(ctx.branch, ctx.base, ctx.title, ctx.body)
        .context("create review request")?;
    info!(number = created.number, "review request opened");
    Ok(MergeRecord::ReviewRequest {
        number: created.number,
        url: created.url,
    })
}

/// Squash the branch into one commit on the base branch and push it.
///
/// On failure the base branch is rewound to its previous tip and the work
/// branch is checked out again, leaving the tree as it was.
fn direct_publish<H: HostApi>(git: &Git, host: &H, ctx: &MergeContext<'_>) -> Result<MergeRecord> {
    let base_tip = git.rev_parse(ctx.base)?;

    let attempt = (|| -> Result<MergeRecord> {
        git.checkout_branch(ctx.base)?;
        if let Some(conflict) = git.merge_squash(ctx.branch)? {
            return Err(anyhow!("squash merge failed: {conflict}"));
        }
        if !git.commit_staged(&squash_message(ctx))? {
            return Err(anyhow!("squash produced no changes to commit"));
        }
        let commit = git.rev_parse("HEAD")?;
        if let Some(reason) = git.push_branch(ctx.base)? {
            return Err(anyhow!("push of {} rejected: {reason}", ctx.base));
        }
        info!(commit = %commit, "squash commit published");

        // Work is merged at this point; closing the originating item is
        // best-effort and must not trigger the review-request fallback.
        if let Some(item) = ctx.request
            && let Err(err) = host.close_with_comment(item, &format!("Shipped in {commit}."))
        {
            warn!(error = %format!("{err:#}"), "could not close originating item");
        }

        git.checkout_branch(ctx.branch)?;
        Ok(MergeRecord::DirectPublish { commit })
    })();

    if attempt.is_err() && git.current_branch().is_ok_and(|b| b == ctx.base) {
        // Only rewind when the failure left us on the base branch; resetting
        // anywhere else would clobber the work branch.
        if let Err(err) = git.reset_hard(&base_tip) {
            warn!(error = %format!("{err:#}"), "could not rewind base branch");
        }
        if let Err(err) = git.checkout_branch(ctx.branch) {
            warn!(error = %format!("{err:#}"), "could not return to work branch");
        }
    }

    attempt
}

fn squash_message(ctx: &MergeContext<'_>) -> String {
    match ctx.request {
        Some(item) => format!("{}\n\nCloses: #{item}\n", ctx.title.trim()),
        None => format!("{}\n", ctx.title.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedHost, TestRepo};

    #[test]
    fn review_request_path_creates_then_updates() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        git.checkout_new_branch("work").expect("branch");
        let host = ScriptedHost::new();
        let ctx = MergeContext {
            branch: "work",
            base: "main",
            request: Some(7),
            title: "Fix the widget",
            body: "Closes #7.",
        };

        let first = resolve(MergeStrategy::ReviewRequest, &git, &host, &ctx).expect("resolve");
        let MergeRecord::ReviewRequest { number, .. } = first else {
            panic!("expected review request record, got {first:?}");
        };
        assert_eq!(host.created.borrow().len(), 1);

        // A second SHIP against the same branch updates instead of re-opening.
        let second = resolve(MergeStrategy::ReviewRequest, &git, &host, &ctx).expect("resolve");
        let MergeRecord::ReviewRequest { number: again, .. } = second else {
            panic!("expected review request record, got {second:?}");
        };
        assert_eq!(again, number);
        assert_eq!(host.created.borrow().len(), 1);
        assert_eq!(host.updated_titles.borrow().len(), 1);
    }

    #[test]
    fn direct_publish_squashes_pushes_and_closes() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        git.checkout_new_branch("work").expect("branch");
        repo.commit_file("feature.txt", "one\n", "feat: part one")
            .expect("commit");
        repo.commit_file("feature.txt", "one\ntwo\n", "feat: part two")
            .expect("commit");

        let host = ScriptedHost::new();
        let ctx = MergeContext {
            branch: "work",
            base: "main",
            request: Some(9),
            title: "Add the feature",
            body: "Closes #9.",
        };

        let record = resolve(MergeStrategy::DirectPublish, &git, &host, &ctx).expect("resolve");
        let MergeRecord::DirectPublish { commit } = record else {
            panic!("expected direct publish record, got {record:?}");
        };

        // One squash commit with the title and trailer landed on main.
        assert_eq!(git.rev_parse("main").expect("main tip"), commit);
        let message = repo.commit_message("main").expect("message");
        assert!(message.contains("Add the feature"));
        assert!(message.contains("Closes: #9"));

        // Pushed, closed, and back on the work branch.
        assert_eq!(
            repo.remote_branch_tip("main").expect("remote"),
            Some(commit)
        );
        assert_eq!(host.closed.borrow().len(), 1);
        assert_eq!(git.current_branch().expect("branch"), "work");
    }

    /// A squash conflict degrades to the review-request path and leaves both
    /// branches untouched.
    #[test]
    fn direct_publish_conflict_falls_back_to_review_request() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        git.checkout_new_branch("work").expect("branch");
        repo.commit_file("README.md", "work version\n", "docs: work edit")
            .expect("commit");
        git.checkout_branch("main").expect("checkout main");
        repo.commit_file("README.md", "main version\n", "docs: main edit")
            .expect("commit");
        let main_tip = git.rev_parse("main").expect("tip");
        git.checkout_branch("work").expect("checkout work");

        let host = ScriptedHost::new();
        let ctx = MergeContext {
            branch: "work",
            base: "main",
            request: Some(3),
            title: "Conflicting edit",
            body: "Closes #3.",
        };

        let record = resolve(MergeStrategy::DirectPublish, &git, &host, &ctx).expect("resolve");
        assert!(matches!(record, MergeRecord::ReviewRequest { .. }));
        assert_eq!(host.created.borrow().len(), 1);
        assert!(host.closed.borrow().is_empty());

        // Base rewound, work branch checked out, tree clean.
        assert_eq!(git.rev_parse("main").expect("tip"), main_tip);
        assert_eq!(git.current_branch().expect("branch"), "work");
        assert!(git.status_porcelain().expect("status").is_empty());
    }
}
