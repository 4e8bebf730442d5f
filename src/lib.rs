//! nightmend library crate
//!
//! Exposes the remediation pipeline so the binary, integration tests and
//! benchmarks drive the same code.

pub mod ai;
pub mod backup;
pub mod config;
pub mod diff;
pub mod dispatch;
pub mod error;
pub mod failure;
pub mod learning;
pub mod logging;
pub mod matchers;
pub mod orchestrator;
pub mod patch;
pub mod runner;
pub mod util;
pub mod vcs;

pub use error::{FixError, FixResult};
