use super::state::{IterationRecord, RunState, RunSummary, Termination};
use crate::config::{HealConfig, SyncInvocation};
use crate::errors::{HarnessError, HarnessResult};
use crate::monitor::LogTailMonitor;
use crate::recovery::{CheckpointRecovery, DatabaseTool};
use crate::supervisor::{LogMode, ProcessHandle, ProcessSupervisor};
use crate::ui::HarnessUi;
use crate::workspace::{WorkspaceGuard, WorkspaceManager};
use dbheal_common::{Checkpoint, IterationResult, Verdict};
use std::path::{Path, PathBuf};

pub const SYNC_LOG: &str = "sync.log";
pub const TOOL_LOG: &str = "db-tool.log";
pub const SNAPSHOT_FILE: &str = "snapshot.dat";

/// Drives the crash → recover → resume loop.
pub struct IterationOrchestrator<'a, T: DatabaseTool + ?Sized> {
    config: &'a HealConfig,
    tool: &'a T,
    ui: &'a HarnessUi,
    workspace: WorkspaceManager,
    supervisor: ProcessSupervisor,
    monitor: LogTailMonitor,
}

impl<'a, T: DatabaseTool + ?Sized> IterationOrchestrator<'a, T> {
    pub fn new(config: &'a HealConfig, tool: &'a T, ui: &'a HarnessUi) -> Self {
        Self {
            config,
            tool,
            ui,
            workspace: WorkspaceManager::new(config.work_root()),
            supervisor: ProcessSupervisor::new(),
            monitor: LogTailMonitor::from_config(config),
        }
    }

    fn sync_log(&self) -> PathBuf {
        self.workspace.file(SYNC_LOG)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.workspace.file(SNAPSHOT_FILE)
    }

    /// Run until `Terminated`. The temp root is removed before this returns,
    /// whatever the outcome.
    pub async fn run(&self) -> RunSummary {
        let mut records = Vec::new();

        if let Err(e) = self.workspace.prepare() {
            return RunSummary {
                termination: Termination::failure(e.to_string(), None),
                records,
            };
        }

        let termination = {
            let _guard = WorkspaceGuard::new(&self.workspace);
            let termination = match self.drive(&mut records).await {
                Ok(termination) => termination,
                Err(e) => {
                    tracing::error!(error = %e, "run aborted");
                    Termination::failure(e.to_string(), e.diagnostic_log().map(str::to_string))
                }
            };
            if let Termination::Failure { reason, .. } = &termination {
                close_open_record(
                    &mut records,
                    IterationResult::Fatal {
                        reason: reason.clone(),
                    },
                );
            }
            self.ui.cleaning(self.workspace.root());
            termination
        };

        RunSummary {
            termination,
            records,
        }
    }

    async fn drive(&self, records: &mut Vec<IterationRecord>) -> HarnessResult<Termination> {
        let total = self.config.iterations;
        let mut state = RunState::Bootstrapping;
        let mut process: Option<ProcessHandle> = None;
        let mut last_recovered: Option<Checkpoint> = None;

        loop {
            tracing::debug!(state = state.name(), "entering state");
            state = match state {
                RunState::Bootstrapping => {
                    self.ui.bootstrapping();
                    let first_block = self.config.first_block;
                    records.push(IterationRecord::new(0, first_block));
                    process = Some(self.launch(None, first_block)?);
                    RunState::Running {
                        iteration: 0,
                        start: Checkpoint::new(first_block),
                    }
                }

                RunState::Running { iteration, start } => {
                    let Some(mut handle) = process.take() else {
                        return Err(anyhow::anyhow!("no sync process to watch").into());
                    };
                    let verdict = match self.monitor.watch(&mut handle, start).await {
                        Ok(verdict) => verdict,
                        Err(e) => {
                            // Reap the child before the work root is removed.
                            stop(&mut handle).await;
                            return Err(e);
                        }
                    };
                    if verdict.is_fatal() {
                        handle.terminate()?;
                    }
                    // The database tool must never run against a store the
                    // sync process still holds open.
                    handle.wait().await?;

                    if let Some(record) = records.last_mut() {
                        record.verdict = Some(verdict.clone());
                    }
                    self.on_verdict(records, iteration, verdict)
                }

                RunState::Cleaning {
                    iteration,
                    candidate,
                } => {
                    // The killed run wrote the newest database; the one it
                    // resumed from is no longer needed.
                    let current = self.workspace.locate_current()?;
                    let removed = self.workspace.remove_stale(&current);
                    tracing::debug!(db = %current.path().display(), removed, "located working database");
                    if iteration == 0 {
                        self.ui.loop_started();
                    }
                    RunState::Recovering {
                        iteration: iteration + 1,
                        candidate,
                        db: current,
                    }
                }

                RunState::Recovering {
                    iteration,
                    candidate,
                    db,
                } => {
                    self.ui.recovering(iteration, total, candidate);
                    let mut record = IterationRecord::new(iteration, 0);
                    record.candidate = Some(candidate);
                    records.push(record);

                    let outcome = CheckpointRecovery::new(self.tool, self.snapshot_path())
                        .recover(&db, candidate)
                        .await?;
                    let recovered = outcome.recovered_checkpoint;
                    if outcome.used_fallback {
                        self.ui.fallback(candidate, recovered);
                    }
                    self.ui.recovered(recovered);

                    if let Some(record) = records.last_mut() {
                        record.recovered = Some(recovered);
                        record.used_fallback = outcome.used_fallback;
                    }

                    match last_recovered {
                        Some(previous) if recovered < previous => {
                            RunState::Terminated(Termination::failure(
                                format!(
                                    "archive lost state: recovered checkpoint {} is behind previously recovered {}",
                                    recovered, previous
                                ),
                                Some(self.tool.captured_log()),
                            ))
                        }
                        _ => {
                            last_recovered = Some(recovered);
                            RunState::Resuming {
                                iteration,
                                outcome,
                                db,
                            }
                        }
                    }
                }

                RunState::Resuming {
                    iteration,
                    outcome,
                    db,
                } => {
                    let checkpoint = outcome.recovered_checkpoint;
                    if checkpoint.block() >= self.config.last_block {
                        close_open_record(records, IterationResult::Success);
                        RunState::Terminated(Termination::SyncCompleted { checkpoint })
                    } else {
                        let first_block = checkpoint.resume_block();
                        if let Some(record) = records.last_mut() {
                            record.start_block = first_block;
                        }
                        self.ui.sync_restarted(first_block);
                        process = Some(self.launch(Some(db.path()), first_block)?);
                        RunState::Running {
                            iteration,
                            start: checkpoint,
                        }
                    }
                }

                RunState::Terminated(termination) => return Ok(termination),
            };
        }
    }

    fn on_verdict(
        &self,
        records: &mut [IterationRecord],
        iteration: u32,
        verdict: Verdict,
    ) -> RunState {
        match verdict {
            Verdict::TimedOut { last_seen } => {
                self.ui.interrupted(last_seen);
                close_open_record(records, IterationResult::Success);
                if iteration > 0 {
                    self.ui.iteration_done();
                }
                if iteration >= self.config.iterations {
                    RunState::Terminated(Termination::IterationsExhausted {
                        iterations: self.config.iterations,
                    })
                } else {
                    RunState::Cleaning {
                        iteration,
                        candidate: last_seen,
                    }
                }
            }
            Verdict::CheckpointFound { checkpoint } => {
                tracing::info!(checkpoint = %checkpoint, "sync reached its final block");
                close_open_record(records, IterationResult::Success);
                RunState::Terminated(Termination::SyncCompleted { checkpoint })
            }
            Verdict::FatalLogSignal { reason } => {
                let log = std::fs::read_to_string(self.sync_log()).ok();
                close_open_record(
                    records,
                    IterationResult::Fatal {
                        reason: reason.clone(),
                    },
                );
                RunState::Terminated(Termination::failure(reason, log))
            }
        }
    }

    fn launch(&self, db_src: Option<&Path>, first_block: u64) -> HarnessResult<ProcessHandle> {
        let root = self.workspace.root();
        let spec = self.config.sync.render(
            self.config,
            &SyncInvocation {
                db_tmp: root,
                db_src,
                first_block,
                last_block: self.config.last_block,
            },
        );
        tracing::info!(command = %spec.display(), "launching sync process");
        let mode = if self.config.append_logs {
            LogMode::Append
        } else {
            LogMode::Truncate
        };
        self.supervisor
            .start(&spec, &self.sync_log(), mode)
            .map_err(|e| {
                if let HarnessError::Launch { program, .. } = &e {
                    tracing::error!(program = %program, "sync process could not be launched");
                }
                e
            })
    }
}

async fn stop(handle: &mut ProcessHandle) {
    if let Err(e) = handle.terminate() {
        tracing::warn!(pid = handle.pid(), error = %e, "failed to signal sync process");
    }
    if let Err(e) = handle.wait().await {
        tracing::warn!(pid = handle.pid(), error = %e, "failed to reap sync process");
    }
}

fn close_open_record(records: &mut [IterationRecord], result: IterationResult) {
    if let Some(record) = records.last_mut() {
        if record.result.is_none() {
            record.close(result);
        }
    }
}
