//! JSON ledger of a finished run.

use crate::config::HealConfig;
use crate::orchestrator::{IterationRecord, RunSummary, Termination};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSettings {
    pub iterations: u32,
    pub window_secs: u64,
    pub checkpoint_granularity: u64,
    pub first_block: u64,
    pub last_block: u64,
    pub tool_root: PathBuf,
    pub source_db: PathBuf,
    pub work_root: PathBuf,
}

impl From<&HealConfig> for ReportSettings {
    fn from(config: &HealConfig) -> Self {
        Self {
            iterations: config.iterations,
            window_secs: config.kill_window.as_secs(),
            checkpoint_granularity: config.checkpoint_granularity,
            first_block: config.first_block,
            last_block: config.last_block,
            tool_root: config.tool_root.clone(),
            source_db: config.source_db.clone(),
            work_root: config.work_root(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub settings: ReportSettings,
    pub outcome: Termination,
    pub iterations: Vec<IterationRecord>,
}

impl RunReport {
    pub fn new(config: &HealConfig, started_at: DateTime<Utc>, summary: &RunSummary) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            success: summary.is_success(),
            settings: ReportSettings::from(config),
            outcome: summary.termination.clone(),
            iterations: summary.records.clone(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create report directory {}", parent.display())
                })?;
            }
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write run report to {}", path.display()))?;
        tracing::info!(path = %path.display(), "run report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliOverrides, HealToml};
    use dbheal_common::{Checkpoint, IterationResult, Verdict};
    use tempfile::tempdir;

    fn config() -> HealConfig {
        HealConfig::resolve(
            HealToml::default(),
            CliOverrides {
                tool_root: Some(PathBuf::from("/opt/aida")),
                source_db: Some(PathBuf::from("/data/aida-db")),
                tmp_dir: Some(PathBuf::from("/scratch")),
                iterations: Some(2),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn summary() -> RunSummary {
        let mut boot = IterationRecord::new(0, 0);
        boot.verdict = Some(Verdict::TimedOut {
            last_seen: Checkpoint::new(30),
        });
        boot.close(IterationResult::Success);

        let mut first = IterationRecord::new(1, 41);
        first.candidate = Some(Checkpoint::new(50));
        first.recovered = Some(Checkpoint::new(40));
        first.used_fallback = true;
        first.close(IterationResult::Fatal {
            reason: "log line contains 'fail'".into(),
        });

        RunSummary {
            termination: Termination::failure("log line contains 'fail'", Some("raw log".into())),
            records: vec![boot, first],
        }
    }

    #[test]
    fn test_report_lists_settings_records_and_outcome() {
        let report = RunReport::new(&config(), Utc::now(), &summary());
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["success"], false);
        assert_eq!(value["settings"]["iterations"], 2);
        assert_eq!(value["settings"]["window_secs"], 5);
        assert_eq!(value["settings"]["work_root"], "/scratch/db-heal-test");
        assert_eq!(value["outcome"]["outcome"], "failure");
        assert!(value["outcome"].get("log").is_none());

        let iterations = value["iterations"].as_array().unwrap();
        assert_eq!(iterations.len(), 2);
        assert_eq!(iterations[0]["verdict"]["verdict"], "timed_out");
        assert_eq!(iterations[1]["candidate"], 50);
        assert_eq!(iterations[1]["recovered"], 40);
        assert_eq!(iterations[1]["used_fallback"], true);
        assert_eq!(iterations[1]["start_block"], 41);
        assert_eq!(iterations[1]["result"]["result"], "fatal");
    }

    #[test]
    fn test_write_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports").join("run.json");
        RunReport::new(&config(), Utc::now(), &summary())
            .write(&path)
            .unwrap();

        let parsed: RunReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.iterations.len(), 2);
        assert!(!parsed.success);
    }
}
