//! Stable exit codes for shipit CLI commands.
//!
//! The three loop terminals map 1:1 to exit codes so automated callers can
//! branch on outcome without parsing logs.

/// The run shipped (also generic command success).
pub const OK: i32 = 0;
/// Fatal error: an agent failed or a command could not proceed.
pub const ERROR: i32 = 1;
/// Iteration budget exhausted without a SHIP verdict; needs human attention.
pub const MAX_ITERATIONS: i32 = 2;
