//! Cooperative tail loop over a growing log file.

use super::classifier::{CheckpointTracker, LineClass, LineClassifier};
use crate::config::HealConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::supervisor::ProcessHandle;
use dbheal_common::{Checkpoint, ProcessStatus, Verdict};
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::Instant;

/// Watches a sync process's log and decides when the run is over.
#[derive(Debug, Clone)]
pub struct LogTailMonitor {
    classifier: LineClassifier,
    kill_window: Duration,
    poll_interval: Duration,
    granularity: u64,
}

impl LogTailMonitor {
    pub fn new(
        classifier: LineClassifier,
        kill_window: Duration,
        poll_interval: Duration,
        granularity: u64,
    ) -> Self {
        Self {
            classifier,
            kill_window,
            poll_interval,
            granularity,
        }
    }

    pub fn from_config(config: &HealConfig) -> Self {
        Self::new(
            LineClassifier::new(
                config.progress_pattern.clone(),
                config.failure_tokens.clone(),
            ),
            config.kill_window,
            config.poll_interval,
            config.checkpoint_granularity,
        )
    }

    /// Follow `handle`'s output from where it started writing until a
    /// verdict is reached.
    ///
    /// The kill window is measured from the first progress line, not from
    /// launch. On timeout the process is asked to terminate before this
    /// returns; the caller still has to wait for it to exit.
    pub async fn watch(
        &self,
        handle: &mut ProcessHandle,
        start: Checkpoint,
    ) -> HarnessResult<Verdict> {
        let path = handle.log_file().to_path_buf();
        let mut reader = open_log(&path, handle.log_offset()).await?;
        let mut tracker = CheckpointTracker::new(start, self.granularity);
        let mut pending: Vec<u8> = Vec::new();
        let mut first_progress: Option<Instant> = None;
        let mut exited: Option<ProcessStatus> = None;

        loop {
            let read = reader
                .read_until(b'\n', &mut pending)
                .await
                .map_err(|source| HarnessError::LogRead {
                    path: path.clone(),
                    source,
                })?;

            if read > 0 && pending.ends_with(b"\n") {
                let line = take_line(&mut pending);
                if let Some(verdict) = self.consume(&line, &mut tracker, &mut first_progress) {
                    return Ok(verdict);
                }
                if self.window_elapsed(first_progress) {
                    return self.interrupt(handle, &tracker);
                }
                continue;
            }

            // No complete line available.
            if let Some(status) = exited {
                // Everything the process wrote is on disk and has been read.
                if !pending.is_empty() {
                    let line = take_line(&mut pending);
                    if let Some(verdict) = self.consume(&line, &mut tracker, &mut first_progress)
                    {
                        return Ok(verdict);
                    }
                }
                return Ok(self.on_exit(status, &tracker));
            }

            // An exit observed here wins over an elapsed window.
            let status = handle.status()?;
            if !status.is_running() {
                // Read once more before deciding so trailing lines are seen.
                exited = Some(status);
                continue;
            }

            if self.window_elapsed(first_progress) {
                return self.interrupt(handle, &tracker);
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Apply one line. Returns a verdict if the line ends the watch.
    fn consume(
        &self,
        line: &str,
        tracker: &mut CheckpointTracker,
        first_progress: &mut Option<Instant>,
    ) -> Option<Verdict> {
        let line = line.trim_end();
        match self.classifier.classify(line) {
            LineClass::Fatal { token } => {
                tracing::warn!(token = %token, line, "failure token in sync log");
                Some(Verdict::FatalLogSignal {
                    reason: format!("log line contains '{}': {}", token, line),
                })
            }
            LineClass::Progress { block } => {
                if first_progress.is_none() {
                    tracing::info!(line, "first progress line, kill window started");
                    *first_progress = Some(Instant::now());
                }
                if let Some(block) = block {
                    if tracker.observe(block) {
                        tracing::debug!(checkpoint = %tracker.current(), "crossed checkpoint boundary");
                    }
                }
                None
            }
            LineClass::Ignored => None,
        }
    }

    fn window_elapsed(&self, first_progress: Option<Instant>) -> bool {
        first_progress.is_some_and(|t| t.elapsed() >= self.kill_window)
    }

    fn interrupt(
        &self,
        handle: &mut ProcessHandle,
        tracker: &CheckpointTracker,
    ) -> HarnessResult<Verdict> {
        let sent = handle.terminate()?;
        if !sent {
            let status = handle.status()?;
            if !status.is_running() {
                // Exited on its own before it could be stopped.
                tracing::info!(pid = handle.pid(), status = %status, "sync process exited before the kill");
                return Ok(self.on_exit(status, tracker));
            }
        }
        tracing::info!(
            pid = handle.pid(),
            sent,
            last_seen = %tracker.current(),
            "kill window elapsed, interrupting"
        );
        Ok(Verdict::TimedOut {
            last_seen: tracker.current(),
        })
    }

    fn on_exit(&self, status: ProcessStatus, tracker: &CheckpointTracker) -> Verdict {
        if status.is_failure() {
            Verdict::FatalLogSignal {
                reason: format!("sync process {}", status),
            }
        } else {
            Verdict::CheckpointFound {
                checkpoint: tracker.current(),
            }
        }
    }
}

/// Drain a buffered line. Invalid UTF-8 is replaced, never fatal.
fn take_line(pending: &mut Vec<u8>) -> String {
    let bytes = std::mem::take(pending);
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Open the log positioned where the watched process started writing.
async fn open_log(path: &Path, offset: u64) -> HarnessResult<BufReader<File>> {
    let read_err = |source| HarnessError::LogRead {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).await.map_err(read_err)?;
    file.seek(SeekFrom::Start(offset)).await.map_err(read_err)?;
    Ok(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PROGRESS_PATTERN;
    use crate::supervisor::{CommandSpec, LogMode, ProcessSupervisor};
    use regex::Regex;
    use tempfile::{TempDir, tempdir};

    fn monitor(window: Duration) -> LogTailMonitor {
        monitor_polling(window, Duration::from_millis(20))
    }

    fn monitor_polling(window: Duration, poll: Duration) -> LogTailMonitor {
        LogTailMonitor::new(
            LineClassifier::new(
                Regex::new(DEFAULT_PROGRESS_PATTERN).unwrap(),
                vec!["exit status".to_string(), "fail".to_string()],
            ),
            window,
            poll,
            10,
        )
    }

    fn spawn(dir: &TempDir, script: &str) -> ProcessHandle {
        ProcessSupervisor::new()
            .start(
                &CommandSpec::new("sh").arg("-c").arg(script),
                &dir.path().join("sync.log"),
                LogMode::Truncate,
            )
            .unwrap()
    }

    async fn watch(
        m: &LogTailMonitor,
        handle: &mut ProcessHandle,
        start: Checkpoint,
    ) -> Verdict {
        tokio::time::timeout(Duration::from_secs(20), m.watch(handle, start))
            .await
            .expect("monitor did not return")
            .unwrap()
    }

    const ENDLESS_PROGRESS: &str =
        "i=10; while true; do echo \"Track: block $i\"; i=$((i+10)); sleep 0.05; done";

    #[tokio::test]
    async fn test_failure_token_before_progress_is_fatal() {
        let dir = tempdir().unwrap();
        let mut handle = spawn(&dir, "echo starting; echo 'priming fail: db locked'; sleep 30");
        let verdict = watch(&monitor(Duration::from_secs(1)), &mut handle, Checkpoint::ZERO).await;

        match verdict {
            Verdict::FatalLogSignal { reason } => assert!(reason.contains("db locked")),
            other => panic!("Expected FatalLogSignal, got {:?}", other),
        }
        assert!(!handle.termination_requested());
        handle.terminate().unwrap();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_exit_status_is_fatal() {
        let dir = tempdir().unwrap();
        let mut handle = spawn(&dir, "echo 'Track: block 10'; exit 1");
        let verdict = watch(&monitor(Duration::from_secs(5)), &mut handle, Checkpoint::ZERO).await;
        match verdict {
            Verdict::FatalLogSignal { reason } => assert!(reason.contains("exited(1)")),
            other => panic!("Expected FatalLogSignal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kill_window_times_out_and_terminates() {
        let dir = tempdir().unwrap();
        let mut handle = spawn(&dir, ENDLESS_PROGRESS);
        let verdict =
            watch(&monitor(Duration::from_millis(500)), &mut handle, Checkpoint::ZERO).await;

        let last_seen = match verdict {
            Verdict::TimedOut { last_seen } => last_seen,
            other => panic!("Expected TimedOut, got {:?}", other),
        };
        assert!(last_seen > Checkpoint::ZERO);
        assert!(last_seen.is_aligned(10));
        assert!(handle.termination_requested());
        let status = handle.wait().await.unwrap();
        assert!(!status.is_success());
    }

    #[tokio::test]
    async fn test_window_starts_at_first_progress_line() {
        let dir = tempdir().unwrap();
        let script = format!("sleep 1; {}", ENDLESS_PROGRESS);
        let mut handle = spawn(&dir, &script);
        let started = std::time::Instant::now();
        let verdict =
            watch(&monitor(Duration::from_millis(500)), &mut handle, Checkpoint::ZERO).await;

        assert!(matches!(verdict, Verdict::TimedOut { .. }));
        assert!(started.elapsed() >= Duration::from_millis(1400));
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_natural_exit_reports_highest_boundary() {
        let dir = tempdir().unwrap();
        let mut handle = spawn(
            &dir,
            "echo 'Track: block 50'; echo 'Track: block 55'; echo 'Track: block 60'; exit 0",
        );
        let verdict =
            watch(&monitor(Duration::from_secs(10)), &mut handle, Checkpoint::new(40)).await;
        assert_eq!(
            verdict,
            Verdict::CheckpointFound {
                checkpoint: Checkpoint::new(60)
            }
        );
    }

    #[tokio::test]
    async fn test_appended_log_skips_earlier_runs() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("sync.log");
        std::fs::write(&log, "Track: block 10\nprevious run fail\n").unwrap();
        let mut handle = ProcessSupervisor::new()
            .start(
                &CommandSpec::new("sh")
                    .arg("-c")
                    .arg("echo 'Track: block 20'; exit 0"),
                &log,
                LogMode::Append,
            )
            .unwrap();
        let verdict =
            watch(&monitor(Duration::from_secs(10)), &mut handle, Checkpoint::new(10)).await;
        assert_eq!(
            verdict,
            Verdict::CheckpointFound {
                checkpoint: Checkpoint::new(20)
            }
        );
    }

    #[tokio::test]
    async fn test_partial_lines_are_joined() {
        let dir = tempdir().unwrap();
        let mut handle = spawn(&dir, "printf 'Track: blo'; sleep 0.3; printf 'ck 10\\n'; exit 0");
        let verdict = watch(&monitor(Duration::from_secs(10)), &mut handle, Checkpoint::ZERO).await;
        assert_eq!(
            verdict,
            Verdict::CheckpointFound {
                checkpoint: Checkpoint::new(10)
            }
        );
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_classified() {
        let dir = tempdir().unwrap();
        let mut handle = spawn(&dir, "echo 'Track: block 10'; printf 'exit status 2'; exit 0");
        let verdict = watch(&monitor(Duration::from_secs(10)), &mut handle, Checkpoint::ZERO).await;
        assert!(verdict.is_fatal());
    }

    #[tokio::test]
    async fn test_invalid_utf8_in_log_is_tolerated() {
        let dir = tempdir().unwrap();
        let script = format!(
            r"echo 'Track: block 10'; printf 'warn: \377\376 bad bytes\n'; {}",
            ENDLESS_PROGRESS
        );
        let mut handle = spawn(&dir, &script);
        let verdict =
            watch(&monitor(Duration::from_millis(500)), &mut handle, Checkpoint::ZERO).await;

        match verdict {
            Verdict::TimedOut { last_seen } => assert!(last_seen >= Checkpoint::new(10)),
            other => panic!("Expected TimedOut, got {:?}", other),
        }
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_exit_inside_window_wins_over_timeout() {
        let dir = tempdir().unwrap();
        let mut handle = spawn(&dir, "echo 'Track: block 10'; sleep 0.3; exit 1");
        // The window elapses during a single poll sleep that also covers the exit.
        let m = monitor_polling(Duration::from_millis(400), Duration::from_millis(600));
        let verdict = watch(&m, &mut handle, Checkpoint::ZERO).await;

        match verdict {
            Verdict::FatalLogSignal { reason } => assert!(reason.contains("exited(1)")),
            other => panic!("Expected FatalLogSignal, got {:?}", other),
        }
        assert!(!handle.termination_requested());
    }

    #[tokio::test]
    async fn test_interrupt_after_failed_exit_is_fatal() {
        let dir = tempdir().unwrap();
        let mut handle = spawn(&dir, "exit 3");
        handle.wait().await.unwrap();
        let mut tracker = CheckpointTracker::new(Checkpoint::ZERO, 10);
        tracker.observe(10);

        let verdict = monitor(Duration::from_millis(100))
            .interrupt(&mut handle, &tracker)
            .unwrap();
        match verdict {
            Verdict::FatalLogSignal { reason } => assert!(reason.contains("exited(3)")),
            other => panic!("Expected FatalLogSignal, got {:?}", other),
        }
    }
}
