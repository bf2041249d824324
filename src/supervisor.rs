//! External process supervision.
//!
//! Every program the harness drives (the sync binary and each database-tool
//! subcommand) is started through [`ProcessSupervisor`], with stdout and
//! stderr attached directly to a log file so output lands on disk as it is
//! produced.

use crate::errors::{HarnessError, HarnessResult};
use dbheal_common::ProcessStatus;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Explicit working directory; `None` inherits the harness's own.
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Command line as shown to the operator.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Whether a log file is started fresh or extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Truncate,
    Append,
}

/// Starts external processes with their output captured to a log file.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self
    }

    /// Launch `spec` with stdout and stderr both written to `log_file`.
    ///
    /// Fails with [`HarnessError::Launch`] when the program is missing or the
    /// working directory does not exist.
    pub fn start(
        &self,
        spec: &CommandSpec,
        log_file: &Path,
        mode: LogMode,
    ) -> HarnessResult<ProcessHandle> {
        let mut options = OpenOptions::new();
        options.create(true);
        match mode {
            LogMode::Truncate => options.write(true).truncate(true),
            LogMode::Append => options.append(true),
        };
        let stdout = options
            .open(log_file)
            .map_err(|source| HarnessError::LogFile {
                path: log_file.to_path_buf(),
                source,
            })?;
        let log_offset = stdout.metadata().map(|m| m.len()).unwrap_or(0);
        let stderr = stdout.try_clone().map_err(|source| HarnessError::LogFile {
            path: log_file.to_path_buf(),
            source,
        })?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| HarnessError::Launch {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        tracing::debug!(pid, command = %spec.display(), log = %log_file.display(), "process started");

        Ok(ProcessHandle {
            child,
            pid,
            log_file: log_file.to_path_buf(),
            log_offset,
            status: ProcessStatus::Running,
            termination_requested: false,
        })
    }

    /// Launch `spec` and block until it exits.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        log_file: &Path,
        mode: LogMode,
    ) -> HarnessResult<ProcessStatus> {
        let mut handle = self.start(spec, log_file, mode)?;
        handle.wait().await
    }
}

/// A running (or finished) external process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    log_file: PathBuf,
    /// Length of the log before this process wrote to it.
    log_offset: u64,
    status: ProcessStatus,
    termination_requested: bool,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn log_offset(&self) -> u64 {
        self.log_offset
    }

    pub fn termination_requested(&self) -> bool {
        self.termination_requested
    }

    /// Poll the exit status without blocking.
    pub fn status(&mut self) -> HarnessResult<ProcessStatus> {
        if let ProcessStatus::Exited { .. } = self.status {
            return Ok(self.status);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = ProcessStatus::Exited {
                    code: status.code(),
                };
            }
            Ok(None) => self.status = ProcessStatus::Running,
            Err(source) => {
                return Err(HarnessError::Wait {
                    pid: self.pid,
                    source,
                });
            }
        }
        Ok(self.status)
    }

    /// Ask the process to stop. Returns without waiting for it to exit.
    ///
    /// The request is sent at most once; `Ok(false)` means nothing was sent
    /// because the process had already exited or was already asked.
    pub fn terminate(&mut self) -> HarnessResult<bool> {
        if self.termination_requested {
            return Ok(false);
        }
        if !self.status()?.is_running() {
            return Ok(false);
        }
        self.termination_requested = true;
        tracing::debug!(pid = self.pid, "requesting termination");
        request_stop(&mut self.child, self.pid).map_err(|source| HarnessError::Signal {
            pid: self.pid,
            source,
        })
    }

    /// Wait for the process to exit and reap it.
    pub async fn wait(&mut self) -> HarnessResult<ProcessStatus> {
        if let ProcessStatus::Exited { .. } = self.status {
            return Ok(self.status);
        }
        let status = self.child.wait().await.map_err(|source| HarnessError::Wait {
            pid: self.pid,
            source,
        })?;
        self.status = ProcessStatus::Exited {
            code: status.code(),
        };
        tracing::debug!(pid = self.pid, status = %self.status, "process exited");
        Ok(self.status)
    }
}

#[cfg(unix)]
fn request_stop(_child: &mut Child, pid: u32) -> std::io::Result<bool> {
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to
    // a child we have not reaped yet, so it cannot have been recycled.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child, _pid: u32) -> std::io::Result<bool> {
    child.start_kill().map(|_| true)
}
