//! CLI entry point for the shipit loop.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use shipit::core::types::FinalStatus;
use shipit::exit_codes;
use shipit::io::agents::ProcessAgent;
use shipit::io::config::load_config;
use shipit::io::git::Git;
use shipit::io::host::{GhHost, HostApi};
use shipit::io::state::{FileStore, StateStore};
use shipit::looping::{LoopRequest, run_loop};
use shipit::publish::{PublishOutcome, PublishRequest, publish};
use shipit::start::{TaskSource, start_run};

#[derive(Parser)]
#[command(
    name = "shipit",
    version,
    about = "Automated propose/review/ship loop for code tasks"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start or resume the loop for a task.
    Run {
        /// Tracked issue number to work on.
        #[arg(long, conflicts_with = "task_file")]
        issue: Option<u64>,
        /// Local markdown task document (first line is the title).
        #[arg(long)]
        task_file: Option<PathBuf>,
        /// Override the configured iteration budget.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Publish the current branch (push with protected-path fallback).
    Publish,
    /// Print the persisted loop state.
    Status,
}

fn main() {
    shipit::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve working directory")?;
    match cli.command {
        Command::Run {
            issue,
            task_file,
            max_iterations,
        } => cmd_run(&root, issue, task_file, max_iterations),
        Command::Publish => cmd_publish(&root),
        Command::Status => cmd_status(&root),
    }
}

fn cmd_run(
    root: &Path,
    issue: Option<u64>,
    task_file: Option<PathBuf>,
    max_iterations: Option<u32>,
) -> Result<i32> {
    let source = match (issue, task_file) {
        (Some(number), None) => TaskSource::Issue(number),
        (None, Some(path)) => TaskSource::File(path),
        _ => return Err(anyhow!("pass exactly one of --issue or --task-file")),
    };

    let host = GhHost::new(root);
    let outcome = start_run(root, &host, &source)?;
    let mut cfg = load_config(&root.join(".shipit").join("config.toml"))?;
    if let Some(limit) = max_iterations {
        cfg.max_iterations = limit;
    }

    let editor = ProcessAgent::new("editor", cfg.editor.command.clone());
    let reviewer = ProcessAgent::new("reviewer", cfg.reviewer.command.clone());
    let store = FileStore::new(root);
    let request = LoopRequest {
        root,
        branch: &outcome.branch,
        base: &outcome.base,
    };

    let result = run_loop(&store, &editor, &reviewer, &host, &cfg, &request, |it| {
        let verdict = it.verdict.map(|v| v.as_str()).unwrap_or("no-commits");
        println!("iteration {}: {verdict}", it.iter);
    })?;

    match result.status {
        FinalStatus::Shipped => {
            println!("shipped after {} iteration(s)", result.iterations);
            Ok(exit_codes::OK)
        }
        FinalStatus::MaxIterations => {
            println!(
                "iteration budget exhausted after {} iteration(s); needs human attention",
                result.iterations
            );
            Ok(exit_codes::MAX_ITERATIONS)
        }
        // Fatal failures surface as Err from run_loop; kept for completeness.
        FinalStatus::Error => Ok(exit_codes::ERROR),
    }
}

fn cmd_publish(root: &Path) -> Result<i32> {
    let git = Git::new(root);
    let host = GhHost::new(root);
    let cfg = load_config(&root.join(".shipit").join("config.toml"))?;
    let state = FileStore::new(root).load()?;
    let branch = git.current_branch()?;
    let base = if cfg.base_branch.is_empty() {
        host.default_branch()?
    } else {
        cfg.base_branch.clone()
    };

    let outcome = publish(
        &git,
        &host,
        &PublishRequest {
            branch: &branch,
            base: &base,
            request: state.request,
            protected_paths: &cfg.protected_paths,
        },
    );
    match outcome {
        PublishOutcome::Success => {
            println!("pushed {branch}");
            Ok(exit_codes::OK)
        }
        PublishOutcome::AlreadyUpToDate => {
            println!("{branch} already up to date");
            Ok(exit_codes::OK)
        }
        PublishOutcome::Failure(reason) => Err(anyhow!("publish failed: {reason}")),
    }
}

fn cmd_status(root: &Path) -> Result<i32> {
    let state = FileStore::new(root).load()?;
    let mut rendered = serde_json::to_string_pretty(&state).context("serialize state")?;
    rendered.push('\n');
    print!("{rendered}");
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_issue() {
        let cli = Cli::parse_from(["shipit", "run", "--issue", "42"]);
        assert!(matches!(
            cli.command,
            Command::Run {
                issue: Some(42),
                task_file: None,
                max_iterations: None
            }
        ));
    }

    #[test]
    fn parse_run_with_task_file_and_budget() {
        let cli = Cli::parse_from(["shipit", "run", "--task-file", "TASK.md", "--max-iterations", "3"]);
        match cli.command {
            Command::Run {
                issue,
                task_file,
                max_iterations,
            } => {
                assert_eq!(issue, None);
                assert_eq!(task_file, Some(PathBuf::from("TASK.md")));
                assert_eq!(max_iterations, Some(3));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn issue_and_task_file_conflict() {
        let parsed = Cli::try_parse_from([
            "shipit",
            "run",
            "--issue",
            "1",
            "--task-file",
            "TASK.md",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_status() {
        let cli = Cli::parse_from(["shipit", "status"]);
        assert!(matches!(cli.command, Command::Status));
    }
}
