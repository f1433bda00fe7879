//! Recursive reasoning loop core.
//!
//! One call to [`step::Engine::run_step`] takes a query at some depth and
//! returns a summary with a convergence flag. The crate keeps a strict split:
//!
//! - **[`core`]**: Pure logic (types, response codec, budgets, mode selection).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (config, audit log, orchestrator
//!   client, completion client, prompt rendering, bounded processes).
//! - **[`skills`]**: The explicit skill registry and its built-in entry points.
//!
//! [`dispatch`], [`self_heal`], [`verticals`] and [`step`] coordinate core logic
//! with I/O; the binary exposes them as CLI commands.

pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod self_heal;
pub mod skills;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verticals;
