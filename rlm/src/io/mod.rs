//! I/O adapters for the reasoning loop.

pub mod audit;
pub mod config;
pub mod orchestrator;
pub mod process;
pub mod prompt;
pub mod source;
