use crate::workspace::WorkingDatabase;
use chrono::{DateTime, Utc};
use dbheal_common::{Checkpoint, IterationResult, RecoveryOutcome, Verdict};
use serde::{Deserialize, Serialize};

/// States of one harness run.
///
/// `Bootstrapping → Running → Cleaning → Recovering → Resuming → Running …`
/// until `Terminated`.
#[derive(Debug)]
pub enum RunState {
    Bootstrapping,
    /// A sync process is live and being watched. `start` is the checkpoint
    /// it resumed from.
    Running { iteration: u32, start: Checkpoint },
    /// The watched process was killed and has exited; the working database
    /// it left behind is located and the one it superseded is discarded.
    Cleaning { iteration: u32, candidate: Checkpoint },
    Recovering {
        iteration: u32,
        candidate: Checkpoint,
        db: WorkingDatabase,
    },
    Resuming {
        iteration: u32,
        outcome: RecoveryOutcome,
        db: WorkingDatabase,
    },
    Terminated(Termination),
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Bootstrapping => "bootstrapping",
            RunState::Running { .. } => "running",
            RunState::Cleaning { .. } => "cleaning",
            RunState::Recovering { .. } => "recovering",
            RunState::Resuming { .. } => "resuming",
            RunState::Terminated(_) => "terminated",
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Termination {
    /// Every configured iteration completed.
    IterationsExhausted { iterations: u32 },
    /// The sync process reached its final block without being killed.
    SyncCompleted { checkpoint: Checkpoint },
    Failure {
        reason: String,
        /// Captured output of the external command that failed.
        #[serde(skip)]
        log: Option<String>,
    },
}

impl Termination {
    pub fn is_success(&self) -> bool {
        !matches!(self, Termination::Failure { .. })
    }

    pub fn failure(reason: impl Into<String>, log: Option<String>) -> Self {
        Termination::Failure {
            reason: reason.into(),
            log,
        }
    }
}

/// Ledger entry for one crash/recover/resume pass. Iteration 0 is the
/// bootstrap run, which has no recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub candidate: Option<Checkpoint>,
    pub recovered: Option<Checkpoint>,
    pub used_fallback: bool,
    pub start_block: u64,
    pub verdict: Option<Verdict>,
    pub result: Option<IterationResult>,
    pub duration_ms: u64,
}

impl IterationRecord {
    pub fn new(iteration: u32, start_block: u64) -> Self {
        Self {
            iteration,
            started_at: Utc::now(),
            candidate: None,
            recovered: None,
            used_fallback: false,
            start_block,
            verdict: None,
            result: None,
            duration_ms: 0,
        }
    }

    pub fn close(&mut self, result: IterationResult) {
        let elapsed = Utc::now() - self.started_at;
        self.duration_ms = elapsed.num_milliseconds().max(0) as u64;
        self.result = Some(result);
    }
}

/// What a finished run hands back to the caller.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub termination: Termination,
    pub records: Vec<IterationRecord>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.termination.is_success()
    }

    /// Checkpoints recovered to, in order.
    pub fn recovered_checkpoints(&self) -> Vec<Checkpoint> {
        self.records.iter().filter_map(|r| r.recovered).collect()
    }

    pub fn completed_iterations(&self) -> u32 {
        self.records
            .iter()
            .filter(|r| r.iteration > 0 && r.result.as_ref().is_some_and(|res| res.is_success()))
            .count() as u32
    }
}
