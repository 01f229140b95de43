//! Command-line interface for annoflow.
//!
//! Maps arguments onto the orchestrator entry contract and builds the run
//! context; all batch behavior lives in the library.

mod commands;

pub use commands::{parse_cli, run_with_cli};
