//! Crash → recover → resume state machine.
//!
//! [`IterationOrchestrator`] owns the single mutable [`RunState`]; every
//! other component is invoked from it and reports back through return
//! values. Exactly one external process is alive at any time.

pub mod runner;
pub mod state;

pub use runner::{IterationOrchestrator, SNAPSHOT_FILE, SYNC_LOG, TOOL_LOG};
pub use state::{IterationRecord, RunState, RunSummary, Termination};
