//! Loop configuration stored under `.shipit/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::MergeStrategy;

/// Loop configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShipitConfig {
    /// Hard ceiling on work/review/decide cycles for one run.
    pub max_iterations: u32,

    /// Base branch to diff and merge against. Empty means "ask the host for
    /// its default branch".
    pub base_branch: String,

    /// Merge strategy literal; unrecognized values fall back to
    /// review-request (see [`MergeStrategy::parse`]).
    pub merge_strategy: String,

    /// Path prefixes the hosting platform refuses to accept from this
    /// automation's identity.
    pub protected_paths: Vec<String>,

    /// Total per-iteration wall-clock budget in seconds (edit + review).
    pub iteration_timeout_secs: u64,

    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub agent_output_limit_bytes: usize,

    pub editor: AgentConfig,
    pub reviewer: AgentConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Command to spawn for this agent (e.g. a site-provided wrapper that
    /// adapts the local coding agent to the stdin/`SHIPIT_OUTPUT` contract).
    pub command: Vec<String>,
}

impl Default for ShipitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            base_branch: String::new(),
            merge_strategy: "review-request".to_string(),
            protected_paths: vec![".github/workflows/".to_string()],
            iteration_timeout_secs: 30 * 60,
            agent_output_limit_bytes: 100_000,
            editor: AgentConfig {
                command: vec!["shipit-editor".to_string()],
            },
            reviewer: AgentConfig {
                command: vec!["shipit-reviewer".to_string()],
            },
        }
    }
}

impl ShipitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        for (label, agent) in [("editor", &self.editor), ("reviewer", &self.reviewer)] {
            if agent.command.is_empty() || agent.command[0].trim().is_empty() {
                return Err(anyhow!("{label}.command must be a non-empty array"));
            }
        }
        if self.protected_paths.iter().any(|p| p.trim().is_empty()) {
            return Err(anyhow!("protected_paths entries must be non-empty"));
        }
        Ok(())
    }

    /// Resolved merge strategy (permissive parse of the configured literal).
    pub fn strategy(&self) -> MergeStrategy {
        MergeStrategy::parse(&self.merge_strategy)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ShipitConfig::default()`.
pub fn load_config(path: &Path) -> Result<ShipitConfig> {
    if !path.exists() {
        let cfg = ShipitConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ShipitConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ShipitConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ShipitConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = ShipitConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn unrecognized_strategy_resolves_to_review_request() {
        let cfg = ShipitConfig {
            merge_strategy: "octopus".to_string(),
            ..ShipitConfig::default()
        };
        assert_eq!(cfg.strategy(), MergeStrategy::ReviewRequest);
    }

    #[test]
    fn empty_agent_command_is_rejected() {
        let cfg = ShipitConfig {
            editor: AgentConfig { command: Vec::new() },
            ..ShipitConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("editor.command"));
    }
}
