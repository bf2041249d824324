//! Typed error hierarchy for the dbheal harness.
//!
//! Only conditions that end a run are errors. Induced kills and fatal log
//! signals are [`dbheal_common::Verdict`]s, and a rejected first reset is
//! recorded on the [`dbheal_common::RecoveryOutcome`].

use dbheal_common::RecoveryFailure;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that terminate a harness run.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open log file at {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read log file at {path}: {source}")]
    LogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Workspace error at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No working database found under {root}")]
    NoWorkingDatabase { root: PathBuf },

    #[error("Recovery failed: {reason}")]
    RecoveryFatal {
        reason: RecoveryFailure,
        /// Full output captured from the database tool, for the operator.
        log: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HarnessError {
    /// Captured external-tool output that should be shown to the operator.
    pub fn diagnostic_log(&self) -> Option<&str> {
        match self {
            HarnessError::RecoveryFatal { log, .. } => Some(log.as_str()),
            _ => None,
        }
    }
}

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_error_names_program_and_keeps_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = HarnessError::Launch {
            program: "aida-vm-sdb".to_string(),
            source: io_err,
        };
        assert!(err.to_string().contains("aida-vm-sdb"));
        match &err {
            HarnessError::Launch { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound)
            }
            _ => panic!("Expected Launch"),
        }
    }

    #[test]
    fn test_recovery_fatal_exposes_diagnostic_log() {
        let err = HarnessError::RecoveryFatal {
            reason: RecoveryFailure::ResetRejected,
            log: "reset: checkpoint 50 not found".to_string(),
        };
        assert_eq!(err.diagnostic_log(), Some("reset: checkpoint 50 not found"));
        assert!(err.to_string().contains("archive reset rejected twice"));
    }

    #[test]
    fn test_other_errors_have_no_diagnostic_log() {
        let err = HarnessError::NoWorkingDatabase {
            root: PathBuf::from("/tmp/db-heal-test"),
        };
        assert!(err.diagnostic_log().is_none());
        let err: HarnessError = anyhow::anyhow!("boom").into();
        assert!(err.diagnostic_log().is_none());
    }

    #[test]
    fn test_all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&HarnessError::NoWorkingDatabase {
            root: PathBuf::from("/tmp/db-heal-test"),
        });
    }
}
