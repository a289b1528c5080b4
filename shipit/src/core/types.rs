//! Shared deterministic types for the loop contract.
//!
//! These types are the stable vocabulary between the loop controller, the
//! publish protocol, and the merge resolver. They carry no I/O state.

use serde::{Deserialize, Serialize};

/// Immutable description of the task being worked on.
///
/// Created once at run start from the originating issue or a local task
/// document; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    pub description: String,
    /// Accumulated discussion text (issue comments), possibly empty.
    #[serde(default)]
    pub discussion: String,
}

/// Terminal state of a run. Written exactly once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    /// The loop terminated via the SHIP transition.
    Shipped,
    /// The iteration budget ran out without a SHIP verdict. Not an error:
    /// the partial work is surfaced for manual follow-up.
    MaxIterations,
    /// An agent failed; the run aborted.
    Error,
}

/// How a terminal SHIP verdict turns into a merge record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Open a review request for the branch, or update the existing one.
    /// The request remains open for a human to merge.
    #[default]
    ReviewRequest,
    /// Squash the branch into one commit and merge it onto the base branch.
    DirectPublish,
}

impl MergeStrategy {
    /// Parse a configured strategy literal.
    ///
    /// Anything other than the two recognized values is treated as
    /// `ReviewRequest`, the safe default.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "direct-publish" => MergeStrategy::DirectPublish,
            _ => MergeStrategy::ReviewRequest,
        }
    }
}

/// Outcome of merge resolution after a terminal SHIP.
///
/// The two variants are mutually exclusive: a run ends with either an open
/// review request or a squash commit on the base branch, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeRecord {
    /// An open, human-mergeable review request for the work branch.
    ReviewRequest { number: u64, url: String },
    /// The squash commit that landed on the base branch.
    DirectPublish { commit: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parse_recognizes_literals() {
        assert_eq!(MergeStrategy::parse("review-request"), MergeStrategy::ReviewRequest);
        assert_eq!(MergeStrategy::parse("direct-publish"), MergeStrategy::DirectPublish);
    }

    #[test]
    fn strategy_parse_falls_back_to_review_request() {
        assert_eq!(MergeStrategy::parse(""), MergeStrategy::ReviewRequest);
        assert_eq!(MergeStrategy::parse("rebase"), MergeStrategy::ReviewRequest);
        assert_eq!(MergeStrategy::parse("DIRECT-PUBLISH"), MergeStrategy::ReviewRequest);
    }

    #[test]
    fn merge_record_round_trips_as_tagged_json() {
        let record = MergeRecord::ReviewRequest {
            number: 12,
            url: "https://example.test/pull/12".to_string(),
        };
        let raw = serde_json::to_string(&record).expect("serialize");
        assert!(raw.contains("\"kind\":\"review_request\""));
        let parsed: MergeRecord = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed, record);
    }
}
