//! Checkpoint recovery.
//!
//! After a sync process has been killed and has fully exited, the archive
//! is rolled back to a checkpoint it durably committed and the live store
//! is rebuilt from a snapshot exported at that same checkpoint.
//!
//! The candidate checkpoint comes from the log monitor and may be ahead of
//! what the archive actually committed. A rejected reset is answered by
//! asking the archive itself (`info`) and retrying once with its answer.

use crate::config::DbToolCommand;
use crate::errors::{HarnessError, HarnessResult};
use crate::supervisor::{LogMode, ProcessSupervisor};
use crate::workspace::WorkingDatabase;
use async_trait::async_trait;
use dbheal_common::{Checkpoint, ProcessStatus, RecoveryFailure, RecoveryOutcome};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// The database-tool subcommands the harness relies on.
#[async_trait]
pub trait DatabaseTool: Send + Sync {
    /// Start a new recovery; the captured log restarts unless appending.
    fn begin_session(&self) -> HarnessResult<()>;

    /// Everything the tool printed during the current session.
    fn captured_log(&self) -> String;

    /// Roll the archive back to exactly `checkpoint`.
    async fn reset(&self, archive: &Path, checkpoint: Checkpoint) -> HarnessResult<ProcessStatus>;

    /// The archive's own view of its latest valid checkpoint. `None` when
    /// the query failed or printed nothing usable.
    async fn latest_checkpoint(&self, archive: &Path) -> HarnessResult<Option<Checkpoint>>;

    async fn export(
        &self,
        archive: &Path,
        checkpoint: Checkpoint,
        snapshot: &Path,
    ) -> HarnessResult<ProcessStatus>;

    async fn import_live_db(&self, snapshot: &Path, live: &Path) -> HarnessResult<ProcessStatus>;
}

/// [`DatabaseTool`] backed by the external tool binary. All subcommands
/// share one log file.
#[derive(Debug)]
pub struct CommandDbTool {
    command: DbToolCommand,
    supervisor: ProcessSupervisor,
    log_file: PathBuf,
    append_logs: bool,
}

impl CommandDbTool {
    pub fn new(command: DbToolCommand, log_file: impl Into<PathBuf>, append_logs: bool) -> Self {
        Self {
            command,
            supervisor: ProcessSupervisor::new(),
            log_file: log_file.into(),
            append_logs,
        }
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    async fn run(&self, name: &str, args: Vec<String>) -> HarnessResult<ProcessStatus> {
        let spec = self.command.subcommand(name, args);
        tracing::debug!(command = %spec.display(), "running database tool");
        let status = self
            .supervisor
            .run(&spec, &self.log_file, LogMode::Append)
            .await?;
        if !status.is_success() {
            tracing::warn!(subcommand = name, status = %status, "database tool failed");
        }
        Ok(status)
    }

    fn log_len(&self) -> u64 {
        std::fs::metadata(&self.log_file)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn read_log_from(&self, offset: u64) -> HarnessResult<String> {
        let read_err = |source| HarnessError::LogRead {
            path: self.log_file.clone(),
            source,
        };
        let mut file = std::fs::File::open(&self.log_file).map_err(read_err)?;
        file.seek(SeekFrom::Start(offset)).map_err(read_err)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(read_err)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait]
impl DatabaseTool for CommandDbTool {
    fn begin_session(&self) -> HarnessResult<()> {
        if self.append_logs {
            return Ok(());
        }
        std::fs::File::create(&self.log_file)
            .map(|_| ())
            .map_err(|source| HarnessError::LogFile {
                path: self.log_file.clone(),
                source,
            })
    }

    fn captured_log(&self) -> String {
        std::fs::read_to_string(&self.log_file).unwrap_or_default()
    }

    async fn reset(&self, archive: &Path, checkpoint: Checkpoint) -> HarnessResult<ProcessStatus> {
        let mut args = self.command.reset_flags.clone();
        args.push(archive.display().to_string());
        args.push(checkpoint.to_string());
        self.run("reset", args).await
    }

    async fn latest_checkpoint(&self, archive: &Path) -> HarnessResult<Option<Checkpoint>> {
        let offset = self.log_len();
        let status = self.run("info", vec![archive.display().to_string()]).await?;
        if !status.is_success() {
            return Ok(None);
        }
        let output = self.read_log_from(offset)?;
        Ok(parse_info_checkpoint(&output))
    }

    async fn export(
        &self,
        archive: &Path,
        checkpoint: Checkpoint,
        snapshot: &Path,
    ) -> HarnessResult<ProcessStatus> {
        self.run(
            "export",
            vec![
                "--block".to_string(),
                checkpoint.to_string(),
                archive.display().to_string(),
                snapshot.display().to_string(),
            ],
        )
        .await
    }

    async fn import_live_db(&self, snapshot: &Path, live: &Path) -> HarnessResult<ProcessStatus> {
        self.run(
            "import-live-db",
            vec![snapshot.display().to_string(), live.display().to_string()],
        )
        .await
    }
}

/// The latest checkpoint is the last word of the last non-empty line that
/// `info` prints.
pub fn parse_info_checkpoint(output: &str) -> Option<Checkpoint> {
    output
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| l.split_whitespace().last())
        .and_then(|w| w.parse().ok())
}

/// Rolls a working database back to a resumable checkpoint.
pub struct CheckpointRecovery<'a, T: DatabaseTool + ?Sized> {
    tool: &'a T,
    snapshot_path: PathBuf,
}

impl<'a, T: DatabaseTool + ?Sized> CheckpointRecovery<'a, T> {
    pub fn new(tool: &'a T, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Reset the archive, export a live snapshot at the reset checkpoint and
    /// rebuild the live store from it.
    ///
    /// Must only be called once the sync process owning `db` has exited.
    pub async fn recover(
        &self,
        db: &WorkingDatabase,
        candidate: Checkpoint,
    ) -> HarnessResult<RecoveryOutcome> {
        self.tool.begin_session()?;
        let archive = db.archive();

        let (checkpoint, used_fallback) = self.reset_archive(&archive, candidate).await?;

        self.export_snapshot(&archive, checkpoint).await?;
        self.rebuild_live(&db.live()).await?;

        tracing::info!(checkpoint = %checkpoint, used_fallback, "recovery complete");
        Ok(RecoveryOutcome {
            recovered_checkpoint: checkpoint,
            snapshot_path: self.snapshot_path.clone(),
            used_fallback,
        })
    }

    async fn reset_archive(
        &self,
        archive: &Path,
        candidate: Checkpoint,
    ) -> HarnessResult<(Checkpoint, bool)> {
        if self.tool.reset(archive, candidate).await?.is_success() {
            return Ok((candidate, false));
        }

        tracing::warn!(
            candidate = %candidate,
            "reset to candidate checkpoint rejected, querying archive for its latest checkpoint"
        );
        let Some(latest) = self.tool.latest_checkpoint(archive).await? else {
            return Err(self.fatal(RecoveryFailure::QueryFailed, None));
        };

        if self.tool.reset(archive, latest).await?.is_success() {
            Ok((latest, true))
        } else {
            Err(self.fatal(RecoveryFailure::ResetRejected, None))
        }
    }

    async fn export_snapshot(&self, archive: &Path, checkpoint: Checkpoint) -> HarnessResult<()> {
        match std::fs::remove_file(&self.snapshot_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(self.fatal(
                    RecoveryFailure::ExportFailed,
                    Some(format!(
                        "cannot remove old snapshot {}: {}",
                        self.snapshot_path.display(),
                        e
                    )),
                ));
            }
        }

        let status = self
            .tool
            .export(archive, checkpoint, &self.snapshot_path)
            .await?;
        if !status.is_success() {
            return Err(self.fatal(RecoveryFailure::ExportFailed, None));
        }
        if !self.snapshot_path.exists() {
            return Err(self.fatal(
                RecoveryFailure::ExportFailed,
                Some(format!(
                    "export reported success but {} does not exist",
                    self.snapshot_path.display()
                )),
            ));
        }
        Ok(())
    }

    async fn rebuild_live(&self, live: &Path) -> HarnessResult<()> {
        if let Err(e) = std::fs::remove_dir_all(live) {
            return Err(self.fatal(
                RecoveryFailure::LiveStoreRemoval,
                Some(format!("cannot remove live store {}: {}", live.display(), e)),
            ));
        }

        let status = self.tool.import_live_db(&self.snapshot_path, live).await?;
        if !status.is_success() {
            return Err(self.fatal(RecoveryFailure::ImportFailed, None));
        }
        Ok(())
    }

    fn fatal(&self, reason: RecoveryFailure, detail: Option<String>) -> HarnessError {
        let mut log = self.tool.captured_log();
        if let Some(detail) = detail {
            if !log.is_empty() && !log.ends_with('\n') {
                log.push('\n');
            }
            log.push_str(&detail);
            log.push('\n');
        }
        HarnessError::RecoveryFatal { reason, log }
    }
}
