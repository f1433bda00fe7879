//! Stable exit codes for rlm CLI commands.

/// Command succeeded; for `rlm step`, the step converged.
pub const OK: i32 = 0;
/// Command failed due to invalid config, arguments, or other setup errors.
pub const INVALID: i32 = 1;
/// `rlm step` returned a summary that did not converge.
pub const NOT_CONVERGED: i32 = 2;
