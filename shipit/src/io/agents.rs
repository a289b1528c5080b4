//! Agent process invocation.
//!
//! The [`AgentRunner`] trait decouples the loop from the editing/reviewing
//! backends. [`ProcessAgent`] spawns a configured command, feeds the prompt
//! on stdin, and expects a JSON output document at the path passed via the
//! `SHIPIT_OUTPUT` environment variable (the constraining schema path is in
//! `SHIPIT_OUTPUT_SCHEMA`). Outputs are validated against their schema
//! before anything downstream trusts them. Tests use scripted runners that
//! write predetermined outputs without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

pub const EDIT_OUTPUT_SCHEMA: &str = include_str!("../../schemas/edit_output.schema.json");
pub const REVIEW_OUTPUT_SCHEMA: &str = include_str!("../../schemas/review_output.schema.json");

/// Output document the editing agent must produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOutput {
    /// Human-readable summary of the changes made.
    pub summary: String,
}

/// Output document the reviewing agent must produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewOutput {
    /// Freeform verdict text; normalized by the caller.
    pub verdict: String,
    /// Feedback for the next iteration.
    #[serde(default)]
    pub feedback: String,
    /// Optional title for the eventual merge record.
    #[serde(default)]
    pub title: Option<String>,
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text fed to the agent on stdin.
    pub prompt: String,
    /// Path to the JSON Schema that constrains agent output.
    pub output_schema_path: PathBuf,
    /// Path where the agent must write its output JSON.
    pub output_path: PathBuf,
    /// Path to write the captured stdout/stderr log.
    pub log_path: PathBuf,
    /// Maximum time to wait for the agent to complete.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Abstraction over agent execution backends.
pub trait AgentRunner {
    /// Run the agent. Must leave an output document at `request.output_path`.
    fn exec(&self, request: &AgentRequest) -> Result<()>;
}

/// Runner that spawns a configured command.
pub struct ProcessAgent {
    label: &'static str,
    command: Vec<String>,
}

impl ProcessAgent {
    pub fn new(label: &'static str, command: Vec<String>) -> Self {
        Self { label, command }
    }
}

impl AgentRunner for ProcessAgent {
    #[instrument(skip_all, fields(agent = self.label, timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &AgentRequest) -> Result<()> {
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow!("{} command is empty", self.label))?;
        info!(program = %program, workdir = %request.workdir.display(), "starting agent");

        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..])
            .current_dir(&request.workdir)
            .env("SHIPIT_OUTPUT", &request.output_path)
            .env("SHIPIT_OUTPUT_SCHEMA", &request.output_schema_path);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run {} agent", self.label))?;

        write_agent_log(
            &request.log_path,
            &output.render_log(self.label),
            request.output_limit_bytes,
        )?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(anyhow!(
                "{} agent timed out after {:?}",
                self.label,
                request.timeout
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(anyhow!(
                "{} agent failed with status {:?}",
                self.label,
                output.status.code()
            ));
        }

        debug!("agent completed");
        Ok(())
    }
}

/// Execute the agent and load its schema-validated output document.
#[instrument(skip_all, fields(output_path = %request.output_path.display()))]
pub fn execute_and_load<A: AgentRunner, T: DeserializeOwned>(
    runner: &A,
    request: &AgentRequest,
    schema: &str,
) -> Result<T> {
    runner.exec(request)?;
    if !request.output_path.exists() {
        return Err(anyhow!(
            "missing agent output {}",
            request.output_path.display()
        ));
    }
    let contents = fs::read_to_string(&request.output_path)
        .with_context(|| format!("read agent output {}", request.output_path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", request.output_path.display()))?;
    validate_schema(&value, schema)?;
    let parsed = serde_json::from_value(value)
        .with_context(|| format!("parse {} as output document", request.output_path.display()))?;
    Ok(parsed)
}

/// Write an embedded schema where the agent process can read it.
pub fn write_schema(path: &Path, schema: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create schema dir {}", parent.display()))?;
    }
    fs::write(path, schema).with_context(|| format!("write schema {}", path.display()))
}

/// Validate a JSON instance against a JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema_raw: &str) -> Result<()> {
    let schema_json: Value = serde_json::from_str(schema_raw).context("parse output schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema_json)
        .context("compile output schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!(
            "agent output failed schema validation:\n- {}",
            messages.join("\n- ")
        );
    }
    Ok(())
}

fn write_agent_log(path: &Path, body: &str, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    if body.len() > output_limit {
        let truncated = format!(
            "{}\n[truncated {} bytes]\n",
            &body[..output_limit],
            body.len() - output_limit
        );
        return fs::write(path, truncated)
            .with_context(|| format!("write agent log {}", path.display()));
    }
    fs::write(path, body).with_context(|| format!("write agent log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FakeAgent {
        output: Option<serde_json::Value>,
    }

    impl AgentRunner for FakeAgent {
        fn exec(&self, request: &AgentRequest) -> Result<()> {
            if let Some(output) = &self.output {
                let mut buf = serde_json::to_string_pretty(output)?;
                buf.push('\n');
                fs::write(&request.output_path, buf)?;
            }
            Ok(())
        }
    }

    fn request(temp: &tempfile::TempDir) -> AgentRequest {
        AgentRequest {
            workdir: temp.path().to_path_buf(),
            prompt: "prompt".to_string(),
            output_schema_path: temp.path().join("schema.json"),
            output_path: temp.path().join("output.json"),
            log_path: temp.path().join("agent.log"),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 1000,
        }
    }

    #[test]
    fn execute_and_load_reads_valid_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fake = FakeAgent {
            output: Some(serde_json::json!({"summary": "did the thing"})),
        };

        let output: EditOutput =
            execute_and_load(&fake, &request(&temp), EDIT_OUTPUT_SCHEMA).expect("load");
        assert_eq!(output.summary, "did the thing");
    }

    #[test]
    fn execute_and_load_errors_on_missing_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fake = FakeAgent { output: None };

        let err = execute_and_load::<_, EditOutput>(&fake, &request(&temp), EDIT_OUTPUT_SCHEMA)
            .unwrap_err();
        assert!(err.to_string().contains("missing agent output"));
    }

    #[test]
    fn schema_violations_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fake = FakeAgent {
            output: Some(serde_json::json!({"summary": ""})),
        };

        let err = execute_and_load::<_, EditOutput>(&fake, &request(&temp), EDIT_OUTPUT_SCHEMA)
            .unwrap_err();
        assert!(err.to_string().contains("schema validation"));
    }

    #[test]
    fn review_output_allows_missing_feedback_and_title() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fake = FakeAgent {
            output: Some(serde_json::json!({"verdict": "SHIP"})),
        };

        let output: ReviewOutput =
            execute_and_load(&fake, &request(&temp), REVIEW_OUTPUT_SCHEMA).expect("load");
        assert_eq!(output.verdict, "SHIP");
        assert!(output.feedback.is_empty());
        assert!(output.title.is_none());
    }
}
