//! Prompt rendering for agent invocations.
//!
//! Thin glue: the templates carry the task text and the per-iteration
//! context (feedback for the editor, change summary for the reviewer).

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::types::TaskSpec;

const EDITOR_TEMPLATE: &str = include_str!("prompts/editor.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("editor", EDITOR_TEMPLATE)
            .expect("editor template should be valid");
        env.add_template("reviewer", REVIEWER_TEMPLATE)
            .expect("reviewer template should be valid");
        Self { env }
    }

    /// Render the editing-agent prompt.
    ///
    /// Feedback is included only when present (iterations after the first).
    pub fn render_editor(
        &self,
        task: &TaskSpec,
        iteration: u32,
        feedback: Option<&str>,
    ) -> Result<String> {
        let template = self.env.get_template("editor")?;
        let rendered = template.render(context! {
            title => task.title.trim(),
            description => task.description.trim(),
            discussion => (!task.discussion.trim().is_empty()).then(|| task.discussion.trim()),
            iteration => iteration,
            feedback => feedback.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    /// Render the reviewing-agent prompt.
    pub fn render_reviewer(&self, task: &TaskSpec, iteration: u32, summary: &str) -> Result<String> {
        let template = self.env.get_template("reviewer")?;
        let rendered = template.render(context! {
            title => task.title.trim(),
            description => task.description.trim(),
            iteration => iteration,
            summary => summary.trim(),
        })?;
        Ok(rendered)
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}
