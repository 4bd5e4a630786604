//! The listening state machine and its phrase tables.

mod machine;
mod phrases;

pub use machine::{ControlDeps, ListenState, Orchestrator, SilenceTracker};
pub use phrases::{PhraseTables, WakeOutcome, classify};
