//! Review verdict normalization.
//!
//! Reviewer output is untrusted free text; the stored value is always the
//! normalized two-value form. Absence or ambiguity fails closed to
//! [`Verdict::Revise`] so a malfunctioning reviewer can never accidentally
//! ship.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Binary review decision for an iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// The reviewer accepted the change set for publication.
    Ship,
    /// Another iteration is required (also the fail-closed default).
    #[default]
    Revise,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Ship => "ship",
            Verdict::Revise => "revise",
        }
    }
}

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ship|revise").expect("verdict token regex should be valid"));

/// Normalize freeform reviewer text into a [`Verdict`].
///
/// Only the first line is considered; the reviewer may surround the token
/// with explanatory prose. The leftmost occurrence of `SHIP` or `REVISE`
/// (any case) wins. Empty input or a line with neither token is `Revise`.
pub fn normalize(raw: &str) -> Verdict {
    let first_line = raw.lines().next().unwrap_or("");
    match TOKEN_RE.find(first_line) {
        Some(m) if m.as_str().eq_ignore_ascii_case("ship") => Verdict::Ship,
        Some(_) => Verdict::Revise,
        None => Verdict::Revise,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_tokens_normalize() {
        assert_eq!(normalize("SHIP"), Verdict::Ship);
        assert_eq!(normalize("REVISE"), Verdict::Revise);
        assert_eq!(normalize("ship"), Verdict::Ship);
    }

    #[test]
    fn token_inside_prose_is_found() {
        assert_eq!(normalize("Verdict: SHIP, nice work overall."), Verdict::Ship);
        assert_eq!(normalize("I would revise the error paths first."), Verdict::Revise);
    }

    #[test]
    fn first_token_on_the_line_wins() {
        assert_eq!(
            normalize("REVISE this before we ship it"),
            Verdict::Revise
        );
        assert_eq!(normalize("ship it, no need to revise"), Verdict::Ship);
    }

    #[test]
    fn unrecognized_input_fails_closed() {
        assert_eq!(normalize(""), Verdict::Revise);
        assert_eq!(normalize("looks good to me"), Verdict::Revise);
        assert_eq!(normalize("approved"), Verdict::Revise);
    }

    #[test]
    fn only_the_first_line_is_considered() {
        assert_eq!(normalize("verdict follows\nSHIP"), Verdict::Revise);
        assert_eq!(normalize("SHIP\nactually, revise"), Verdict::Ship);
    }
}
