//! The propose → review → decide loop controller.
//!
//! State machine over one run: iterate (counter check + increment) → work
//! (editing agent) → review (reviewing agent, then publish) → decide
//! (normalized verdict), terminating in shipped, max-iterations, or error.
//! Every transition persists through the injected state store, so a
//! restarted process resumes at the correct iteration.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::core::types::{FinalStatus, MergeRecord};
use crate::core::verdict::{Verdict, normalize};
use crate::io::agents::{
    AgentRequest, AgentRunner, EDIT_OUTPUT_SCHEMA, EditOutput, REVIEW_OUTPUT_SCHEMA, ReviewOutput,
    execute_and_load, write_schema,
};
use crate::io::config::ShipitConfig;
use crate::io::git::Git;
use crate::io::host::HostApi;
use crate::io::iteration_log::{IterationMeta, IterationPaths, write_meta};
use crate::io::prompt::PromptEngine;
use crate::io::state::{LoopState, StateStore};
use crate::merge::{MergeContext, resolve};
use crate::publish::{PublishOutcome, PublishRequest, publish};

/// Feedback injected when the editing agent produced no commits. Keeps the
/// "agent is stuck" case distinguishable from "agent crashed".
const NO_COMMIT_FEEDBACK: &str = "The previous iteration produced no new commits. Check the \
working tree for unresolved conflicts or uncommitted work, make the required changes, and \
commit them.";

/// Inputs for a loop run, resolved by the caller at bootstrap.
#[derive(Debug, Clone)]
pub struct LoopRequest<'a> {
    pub root: &'a Path,
    pub branch: &'a str,
    pub base: &'a str,
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    pub iterations: u32,
    pub status: FinalStatus,
    pub merge_record: Option<MergeRecord>,
}

/// Snapshot handed to the iteration observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationOutcome {
    pub iter: u32,
    /// `None` on the soft no-commit path (the reviewer never ran).
    pub verdict: Option<Verdict>,
    pub committed: bool,
    pub publish: Option<String>,
}

/// Drive the loop until it reaches a terminal state.
///
/// Fatal agent failures persist [`FinalStatus::Error`] and surface as `Err`;
/// the two graceful terminals come back as a [`LoopOutcome`]. The observer
/// runs after every persisted iteration, including soft no-commit ones.
#[instrument(skip_all, fields(branch = request.branch))]
pub fn run_loop<S, E, R, H, F>(
    store: &S,
    editor: &E,
    reviewer: &R,
    host: &H,
    cfg: &ShipitConfig,
    request: &LoopRequest<'_>,
    mut on_iteration: F,
) -> Result<LoopOutcome>
where
    S: StateStore,
    E: AgentRunner,
    R: AgentRunner,
    H: HostApi,
    F: FnMut(&IterationOutcome),
{
    let git = Git::new(request.root);
    let prompts = PromptEngine::new();
    let mut state = store.load()?;
    let run_id = state
        .run_id
        .clone()
        .ok_or_else(|| anyhow!("missing run id (bootstrap the run first)"))?;
    let task = state
        .task
        .clone()
        .ok_or_else(|| anyhow!("missing task (state was not bootstrapped)"))?;
    if let Some(status) = state.final_status {
        return Err(anyhow!("run {run_id} already terminated ({status:?})"));
    }

    loop {
        if state.iteration >= cfg.max_iterations {
            // Exhaustion is a non-failure terminal: the partial work is
            // surfaced for manual follow-up.
            state.final_status = Some(FinalStatus::MaxIterations);
            store.save(&state)?;
            info!(run_id = %run_id, iterations = state.iteration, "iteration budget exhausted");
            return Ok(LoopOutcome {
                run_id,
                iterations: state.iteration,
                status: FinalStatus::MaxIterations,
                merge_record: None,
            });
        }

        state.iteration += 1;
        store.save(&state)?;
        let iter = state.iteration;
        let started = Instant::now();
        let deadline = started + Duration::from_secs(cfg.iteration_timeout_secs);
        let paths = IterationPaths::new(request.root, &run_id, iter);
        info!(run_id = %run_id, iter, "starting iteration");

        // Work: invoke the editing agent with the task and, after the first
        // iteration, the persisted feedback.
        let head_before = git.rev_parse("HEAD")?;
        let feedback =
            (iter > 1 && !state.feedback.trim().is_empty()).then(|| state.feedback.clone());
        let edit_prompt = prompts.render_editor(&task, iter, feedback.as_deref())?;
        write_schema(&paths.edit_schema_path, EDIT_OUTPUT_SCHEMA)?;
        let edit_request = AgentRequest {
            workdir: request.root.to_path_buf(),
            prompt: edit_prompt,
            output_schema_path: paths.edit_schema_path.clone(),
            output_path: paths.edit_output_path.clone(),
            log_path: paths.edit_log_path.clone(),
            timeout: remaining_budget(deadline)?,
            output_limit_bytes: cfg.agent_output_limit_bytes,
        };
        let edit: EditOutput = match execute_and_load(editor, &edit_request, EDIT_OUTPUT_SCHEMA) {
            Ok(output) => output,
            Err(err) => return fail_run(store, &mut state, err.context("editing agent failed")),
        };

        // Commit whatever the agent left uncommitted, so the no-commit check
        // sees the true picture.
        git.add_all()?;
        let committed = git.commit_staged(&format!("chore(shipit): run {run_id} iter {iter}"))?;
        let head_after = git.rev_parse("HEAD")?;

        if !committed && head_after == head_before {
            // Soft failure: the agent is stuck, not crashed. Loop back with
            // injected guidance and skip the reviewer entirely.
            warn!(run_id = %run_id, iter, "no new commits, injecting guidance");
            state.feedback = NO_COMMIT_FEEDBACK.to_string();
            state.verdict = Verdict::Revise;
            store.save(&state)?;
            write_meta(
                &paths,
                &IterationMeta {
                    run_id: run_id.clone(),
                    iter,
                    verdict: None,
                    committed: false,
                    publish: None,
                    duration_ms: Some(started.elapsed().as_millis() as u64),
                },
            )?;
            on_iteration(&IterationOutcome {
                iter,
                verdict: None,
                committed: false,
                publish: None,
            });
            continue;
        }

        // Review: the reviewer sees the task and the editor's own summary.
        let review_prompt = prompts.render_reviewer(&task, iter, &edit.summary)?;
        write_schema(&paths.review_schema_path, REVIEW_OUTPUT_SCHEMA)?;
        let review_request = AgentRequest {
            workdir: request.root.to_path_buf(),
            prompt: review_prompt,
            output_schema_path: paths.review_schema_path.clone(),
            output_path: paths.review_output_path.clone(),
            log_path: paths.review_log_path.clone(),
            timeout: remaining_budget(deadline)?,
            output_limit_bytes: cfg.agent_output_limit_bytes,
        };
        let review: ReviewOutput =
            match execute_and_load(reviewer, &review_request, REVIEW_OUTPUT_SCHEMA) {
                Ok(output) => output,
                Err(err) => {
                    return fail_run(store, &mut state, err.context("reviewing agent failed"));
                }
            };
        let mut verdict = normalize(&review.verdict);
        state.feedback = review.feedback.clone();

        // Publish. A verdict that cannot be published is not shippable, so a
        // failure here overrides SHIP and feeds the reason to the next edit.
        let publish_outcome = publish(
            &git,
            host,
            &PublishRequest {
                branch: request.branch,
                base: request.base,
                request: state.request,
                protected_paths: &cfg.protected_paths,
            },
        );
        match &publish_outcome {
            PublishOutcome::Failure(reason) => {
                warn!(run_id = %run_id, iter, reason = %reason, "publish failed, forcing revise");
                state.push_error = reason.clone();
                verdict = Verdict::Revise;
                if !state.feedback.is_empty() {
                    state.feedback.push_str("\n\n");
                }
                state
                    .feedback
                    .push_str(&format!("The branch could not be published: {reason}"));
            }
            _ => state.push_error.clear(),
        }

        // Decide.
        state.verdict = verdict;
        store.save(&state)?;
        write_meta(
            &paths,
            &IterationMeta {
                run_id: run_id.clone(),
                iter,
                verdict: Some(verdict),
                committed: true,
                publish: Some(publish_outcome.label().to_string()),
                duration_ms: Some(started.elapsed().as_millis() as u64),
            },
        )?;
        on_iteration(&IterationOutcome {
            iter,
            verdict: Some(verdict),
            committed: true,
            publish: Some(publish_outcome.label().to_string()),
        });

        if verdict == Verdict::Ship {
            let title = review
                .title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| task.title.clone());
            let body = match state.request {
                Some(item) => format!("Closes #{item}."),
                None => task.title.clone(),
            };
            let record = match resolve(
                cfg.strategy(),
                &git,
                host,
                &MergeContext {
                    branch: request.branch,
                    base: request.base,
                    request: state.request,
                    title: &title,
                    body: &body,
                },
            ) {
                Ok(record) => record,
                Err(err) => {
                    return fail_run(store, &mut state, err.context("merge resolution failed"));
                }
            };
            state.merge_record = Some(record.clone());
            state.final_status = Some(FinalStatus::Shipped);
            store.save(&state)?;
            info!(run_id = %run_id, iterations = iter, "shipped");
            return Ok(LoopOutcome {
                run_id,
                iterations: iter,
                status: FinalStatus::Shipped,
                merge_record: Some(record),
            });
        }
    }
}

/// Persist the error terminal and surface the failure to the caller.
fn fail_run<S: StateStore>(
    store: &S,
    state: &mut LoopState,
    err: anyhow::Error,
) -> Result<LoopOutcome> {
    state.final_status = Some(FinalStatus::Error);
    if let Err(save_err) = store.save(state) {
        warn!(error = %format!("{save_err:#}"), "could not persist error status");
    }
    Err(err)
}

fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("iteration timed out"));
    }
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MergeRecord;
    use crate::io::state::FileStore;
    use crate::start::{TaskSource, start_run};
    use crate::test_support::{
        FailingAgent, MemoryStore, ScriptedAgent, ScriptedHost, ScriptedStep, TestRepo,
    };
    use serde_json::json;

    fn bootstrapped(repo: &TestRepo, host: &ScriptedHost) -> (FileStore, String, String) {
        let outcome = start_run(repo.root(), host, &TaskSource::Issue(7)).expect("start");
        (FileStore::new(repo.root()), outcome.branch, outcome.base)
    }

    fn edit_step(file: &str, contents: &str, summary: &str) -> ScriptedStep {
        ScriptedStep {
            output: json!({"summary": summary}),
            write_file: Some((file.to_string(), contents.to_string())),
        }
    }

    fn review_step(verdict: &str, feedback: &str) -> ScriptedStep {
        ScriptedStep {
            output: json!({"verdict": verdict, "feedback": feedback}),
            write_file: None,
        }
    }

    /// Scenario: max_iterations=2 and a reviewer that never ships. The run
    /// exhausts its budget with exactly two editing-agent invocations.
    #[test]
    fn always_revise_ends_in_max_iterations() {
        let repo = TestRepo::new().expect("repo");
        let host = ScriptedHost::new();
        let (store, branch, base) = bootstrapped(&repo, &host);
        let cfg = ShipitConfig {
            max_iterations: 2,
            ..ShipitConfig::default()
        };
        let editor = ScriptedAgent::new(vec![
            edit_step("notes.txt", "one", "first pass"),
            edit_step("notes.txt", "two", "second pass"),
        ]);
        let reviewer = ScriptedAgent::new(vec![
            review_step("REVISE", "tighten the tests"),
            review_step("Needs another REVISE pass", "still not right"),
        ]);

        let mut observed = 0u32;
        let outcome = run_loop(
            &store,
            &editor,
            &reviewer,
            &host,
            &cfg,
            &LoopRequest {
                root: repo.root(),
                branch: &branch,
                base: &base,
            },
            |_| observed += 1,
        )
        .expect("loop");

        assert_eq!(outcome.status, FinalStatus::MaxIterations);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(observed, 2);
        assert_eq!(editor.invocations(), 2);
        assert_eq!(reviewer.invocations(), 2);

        let state = store.load().expect("state");
        assert_eq!(state.final_status, Some(FinalStatus::MaxIterations));
        assert_eq!(state.feedback, "still not right");
        assert!(state.merge_record.is_none());
    }

    /// Scenario: the reviewer ships on iteration 1 with no push errors. One
    /// merge record is produced and the run terminates as shipped.
    #[test]
    fn ship_on_first_iteration_produces_merge_record() {
        let repo = TestRepo::new().expect("repo");
        let host = ScriptedHost::new();
        let (store, branch, base) = bootstrapped(&repo, &host);
        let cfg = ShipitConfig {
            max_iterations: 5,
            ..ShipitConfig::default()
        };
        let editor = ScriptedAgent::new(vec![edit_step("fix.txt", "fixed", "applied the fix")]);
        let reviewer = ScriptedAgent::new(vec![ScriptedStep {
            output: json!({"verdict": "SHIP", "feedback": "", "title": "Fix the wobble"}),
            write_file: None,
        }]);

        let outcome = run_loop(
            &store,
            &editor,
            &reviewer,
            &host,
            &cfg,
            &LoopRequest {
                root: repo.root(),
                branch: &branch,
                base: &base,
            },
            |_| {},
        )
        .expect("loop");

        assert_eq!(outcome.status, FinalStatus::Shipped);
        assert_eq!(outcome.iterations, 1);
        assert!(matches!(
            outcome.merge_record,
            Some(MergeRecord::ReviewRequest { .. })
        ));
        assert_eq!(host.created.borrow().len(), 1);
        assert_eq!(host.updated_titles.borrow().len(), 0);

        let state = store.load().expect("state");
        assert_eq!(state.final_status, Some(FinalStatus::Shipped));
        assert!(state.push_error.is_empty());
    }

    /// An iteration with no new commits skips the reviewer and injects
    /// guidance the next editing prompt must carry.
    #[test]
    fn no_commits_skips_reviewer_and_injects_feedback() {
        let repo = TestRepo::new().expect("repo");
        let host = ScriptedHost::new();
        let (store, branch, base) = bootstrapped(&repo, &host);
        let cfg = ShipitConfig {
            max_iterations: 5,
            ..ShipitConfig::default()
        };
        let editor = ScriptedAgent::new(vec![
            ScriptedStep {
                output: json!({"summary": "nothing happened"}),
                write_file: None,
            },
            edit_step("fix.txt", "fixed", "applied the fix"),
        ]);
        let reviewer = ScriptedAgent::new(vec![review_step("SHIP", "")]);

        let outcome = run_loop(
            &store,
            &editor,
            &reviewer,
            &host,
            &cfg,
            &LoopRequest {
                root: repo.root(),
                branch: &branch,
                base: &base,
            },
            |_| {},
        )
        .expect("loop");

        assert_eq!(outcome.status, FinalStatus::Shipped);
        assert_eq!(outcome.iterations, 2);
        // The reviewer ran once: iteration 1 never reached it.
        assert_eq!(reviewer.invocations(), 1);
        assert_eq!(editor.invocations(), 2);
        // Iteration 2's prompt carried the injected guidance.
        let prompts = editor.prompts.borrow();
        assert!(!prompts[0].contains("no new commits"));
        assert!(prompts[1].contains("no new commits"));
    }

    /// A SHIP verdict with a failing publish is overridden to REVISE: the
    /// run keeps looping instead of terminating.
    #[test]
    fn publish_failure_overrides_ship_verdict() {
        let repo = TestRepo::new().expect("repo");
        let host = ScriptedHost::new();
        let (store, branch, base) = bootstrapped(&repo, &host);
        repo.remove_remote().expect("remove remote");
        let cfg = ShipitConfig {
            max_iterations: 1,
            ..ShipitConfig::default()
        };
        let editor = ScriptedAgent::new(vec![edit_step("fix.txt", "fixed", "applied the fix")]);
        let reviewer = ScriptedAgent::new(vec![review_step("SHIP", "")]);

        let outcome = run_loop(
            &store,
            &editor,
            &reviewer,
            &host,
            &cfg,
            &LoopRequest {
                root: repo.root(),
                branch: &branch,
                base: &base,
            },
            |_| {},
        )
        .expect("loop");

        // Not shipped: the override forced another revision and the budget
        // then ran out.
        assert_eq!(outcome.status, FinalStatus::MaxIterations);
        assert!(outcome.merge_record.is_none());

        let state = store.load().expect("state");
        assert!(!state.push_error.is_empty());
        assert_eq!(state.verdict, Verdict::Revise);
        assert!(state.feedback.contains("could not be published"));
    }

    /// Agent process failure is fatal. The in-memory store substitutes for
    /// the file-backed one through the same seam.
    #[test]
    fn editor_crash_is_a_fatal_error() {
        let repo = TestRepo::new().expect("repo");
        let host = ScriptedHost::new();
        let (file_store, branch, base) = bootstrapped(&repo, &host);
        let store = MemoryStore::with_state(file_store.load().expect("state"));
        let cfg = ShipitConfig::default();
        let reviewer = ScriptedAgent::new(Vec::new());

        let err = run_loop(
            &store,
            &FailingAgent,
            &reviewer,
            &host,
            &cfg,
            &LoopRequest {
                root: repo.root(),
                branch: &branch,
                base: &base,
            },
            |_| {},
        )
        .unwrap_err();
        assert!(err.to_string().contains("editing agent failed"));
        assert_eq!(reviewer.invocations(), 0);
        assert_eq!(store.snapshot().final_status, Some(FinalStatus::Error));
    }

    #[test]
    fn reviewer_crash_is_a_fatal_error() {
        let repo = TestRepo::new().expect("repo");
        let host = ScriptedHost::new();
        let (store, branch, base) = bootstrapped(&repo, &host);
        let cfg = ShipitConfig::default();
        let editor = ScriptedAgent::new(vec![edit_step("fix.txt", "fixed", "applied the fix")]);

        let err = run_loop(
            &store,
            &editor,
            &FailingAgent,
            &host,
            &cfg,
            &LoopRequest {
                root: repo.root(),
                branch: &branch,
                base: &base,
            },
            |_| {},
        )
        .unwrap_err();
        assert!(err.to_string().contains("reviewing agent failed"));

        let state = store.load().expect("state");
        assert_eq!(state.final_status, Some(FinalStatus::Error));
    }

    /// A terminated run refuses to re-enter the loop: the terminal status is
    /// written exactly once.
    #[test]
    fn terminated_run_cannot_be_rerun() {
        let repo = TestRepo::new().expect("repo");
        let host = ScriptedHost::new();
        let (store, branch, base) = bootstrapped(&repo, &host);
        let cfg = ShipitConfig {
            max_iterations: 1,
            ..ShipitConfig::default()
        };
        let editor = ScriptedAgent::new(vec![edit_step("a.txt", "a", "edit")]);
        let reviewer = ScriptedAgent::new(vec![review_step("REVISE", "more")]);
        let request = LoopRequest {
            root: repo.root(),
            branch: &branch,
            base: &base,
        };

        run_loop(&store, &editor, &reviewer, &host, &cfg, &request, |_| {}).expect("loop");
        let err = run_loop(&store, &editor, &reviewer, &host, &cfg, &request, |_| {}).unwrap_err();
        assert!(err.to_string().contains("already terminated"));
    }
}
