//! Pure, deterministic logic: verdict normalization and loop contract types.
//!
//! Nothing in this module performs I/O; everything is testable in isolation.

pub mod types;
pub mod verdict;
