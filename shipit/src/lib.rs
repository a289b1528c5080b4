//! Automated propose → review → decide loop over a git working tree.
//!
//! An external editing agent attempts a task, an independent reviewing agent
//! issues a SHIP/REVISE verdict, and the loop controller repeats, ships, or
//! falls back to a manual path. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (verdict normalization, loop
//!   contract types). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (state store, git, host API, agent
//!   processes). Isolated behind traits to enable scripting in tests.
//!
//! Orchestration modules ([`start`], [`looping`], [`publish`], [`merge`])
//! coordinate core logic with I/O to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod merge;
pub mod publish;
pub mod start;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
