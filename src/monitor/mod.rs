//! Log tailing for a running sync process.
//!
//! The sync binary reports its progress as text lines such as
//! `Track: block 40`. This module classifies those lines and watches the
//! growing log file until one of three things happens:
//!
//! - the kill window elapses after the first progress line (the process is
//!   asked to stop and `Verdict::TimedOut` is returned)
//! - a failure token appears or the process exits with a failure status
//!   (`Verdict::FatalLogSignal`)
//! - the process exits successfully on its own (`Verdict::CheckpointFound`)

mod classifier;
mod tail;

pub use classifier::{CheckpointTracker, LineClass, LineClassifier};
pub use tail::LogTailMonitor;
