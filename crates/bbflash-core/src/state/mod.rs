//! Orchestrator state.

pub mod machine;

pub use machine::{ExpectedVersions, UpdateOutcome, UpdateRun, UpdateStep};
