//! Shared domain types for the dbheal crash-recovery harness.
//!
//! These types flow between the process supervisor, the log monitor, the
//! recovery protocol and the iteration orchestrator, and are serialized into
//! run reports. They carry no I/O of their own.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// A block number at which the archive committed a durable, resettable state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Checkpoint(u64);

impl Checkpoint {
    pub const ZERO: Checkpoint = Checkpoint(0);

    pub const fn new(block: u64) -> Self {
        Self(block)
    }

    pub const fn block(self) -> u64 {
        self.0
    }

    /// The first block a sync resumed from this checkpoint has to process.
    pub const fn resume_block(self) -> u64 {
        self.0 + 1
    }

    /// The next checkpoint boundary strictly after this one for the given
    /// granularity. A granularity of zero is treated as one.
    pub fn next_boundary(self, granularity: u64) -> Checkpoint {
        let g = granularity.max(1);
        Checkpoint((self.0 / g + 1) * g)
    }

    pub fn is_aligned(self, granularity: u64) -> bool {
        granularity != 0 && self.0 % granularity == 0
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors parsing a checkpoint from tool output.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckpointParseError {
    #[error("empty checkpoint value")]
    Empty,
    #[error("'{0}' is not a block number")]
    NotANumber(String),
}

impl FromStr for Checkpoint {
    type Err = CheckpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CheckpointParseError::Empty);
        }
        s.parse::<u64>()
            .map(Checkpoint)
            .map_err(|_| CheckpointParseError::NotANumber(s.to_string()))
    }
}

/// Observable state of a supervised external process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessStatus {
    Unknown,
    Running,
    /// `code` is `None` when the process was ended by a signal.
    Exited { code: Option<i32> },
}

impl ProcessStatus {
    pub fn is_running(self) -> bool {
        matches!(self, ProcessStatus::Running)
    }

    pub fn is_success(self) -> bool {
        matches!(self, ProcessStatus::Exited { code: Some(0) })
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ProcessStatus::Exited { code } if code != Some(0))
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Unknown => write!(f, "unknown"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Exited { code: Some(code) } => write!(f, "exited({})", code),
            ProcessStatus::Exited { code: None } => write!(f, "exited(signal)"),
        }
    }
}

/// Terminal verdict of watching one sync process's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// The kill window elapsed after the first progress line; termination
    /// has already been requested.
    TimedOut { last_seen: Checkpoint },
    /// A failure token was logged or the process exited with a failure code.
    FatalLogSignal { reason: String },
    /// Highest block boundary crossed when the process ended on its own
    /// with a success status before the kill window elapsed.
    CheckpointFound { checkpoint: Checkpoint },
}

impl Verdict {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Verdict::FatalLogSignal { .. })
    }
}

/// Why the recovery protocol gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryFailure {
    /// Both the primary and the fallback reset were rejected.
    ResetRejected,
    /// The `info` query failed or printed no usable checkpoint.
    QueryFailed,
    ExportFailed,
    LiveStoreRemoval,
    ImportFailed,
}

impl fmt::Display for RecoveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryFailure::ResetRejected => "archive reset rejected twice",
            RecoveryFailure::QueryFailed => "latest checkpoint query failed",
            RecoveryFailure::ExportFailed => "live snapshot export failed",
            RecoveryFailure::LiveStoreRemoval => "live store removal failed",
            RecoveryFailure::ImportFailed => "live snapshot import failed",
        };
        f.write_str(s)
    }
}

/// Successful outcome of one recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub recovered_checkpoint: Checkpoint,
    pub snapshot_path: PathBuf,
    /// True when the candidate was rejected and the `info` query supplied
    /// the checkpoint.
    pub used_fallback: bool,
}

/// Result of one crash/recover/resume pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IterationResult {
    Success,
    Fatal { reason: String },
}

impl IterationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, IterationResult::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_parses_trimmed_numbers() {
        assert_eq!("  40\n".parse::<Checkpoint>(), Ok(Checkpoint::new(40)));
        assert_eq!("".parse::<Checkpoint>(), Err(CheckpointParseError::Empty));
        assert!(matches!(
            "block".parse::<Checkpoint>(),
            Err(CheckpointParseError::NotANumber(_))
        ));
    }

    #[test]
    fn test_resume_block_is_one_past_checkpoint() {
        assert_eq!(Checkpoint::new(40).resume_block(), 41);
        assert_eq!(Checkpoint::ZERO.resume_block(), 1);
    }

    #[test]
    fn test_next_boundary_rounds_up_to_granularity() {
        assert_eq!(Checkpoint::ZERO.next_boundary(10), Checkpoint::new(10));
        assert_eq!(Checkpoint::new(40).next_boundary(10), Checkpoint::new(50));
        assert_eq!(Checkpoint::new(41).next_boundary(10), Checkpoint::new(50));
        assert_eq!(Checkpoint::new(7).next_boundary(0), Checkpoint::new(8));
    }

    #[test]
    fn test_alignment_respects_granularity() {
        assert!(Checkpoint::new(30).is_aligned(10));
        assert!(!Checkpoint::new(31).is_aligned(10));
        assert!(!Checkpoint::new(30).is_aligned(0));
    }

    #[test]
    fn test_process_status_classification() {
        assert!(ProcessStatus::Running.is_running());
        assert!(ProcessStatus::Exited { code: Some(0) }.is_success());
        assert!(ProcessStatus::Exited { code: Some(1) }.is_failure());
        assert!(ProcessStatus::Exited { code: None }.is_failure());
        assert!(!ProcessStatus::Unknown.is_failure());
        assert_eq!(ProcessStatus::Exited { code: None }.to_string(), "exited(signal)");
    }

    #[test]
    fn test_verdict_serializes_with_tag() {
        let v = Verdict::TimedOut {
            last_seen: Checkpoint::new(30),
        };
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"verdict":"timed_out","last_seen":30}"#);
        assert!(!v.is_fatal());
        assert!(
            Verdict::FatalLogSignal {
                reason: "fail".into()
            }
            .is_fatal()
        );
    }
}
