//! Harness configuration.
//!
//! Settings are layered file → environment → CLI. The optional TOML file
//! describes how the external programs are invoked; the CLI (with its
//! environment fallbacks) sets the run parameters.
//!
//! # Configuration File Format
//!
//! ```toml
//! [tools]
//! sync_program = "{tool_root}/build/aida-vm-sdb"
//! sync_args = ["substate", "--db-tmp", "{db_tmp}", "{resume_args}", "{first_block}", "{last_block}"]
//! resume_args = ["--db-src", "{db_src}", "--skip-priming"]
//! db_tool_program = "go"
//! db_tool_args = ["run", "./database/mpt/tool"]
//! db_tool_dir = "go"
//! reset_flags = ["--force-unlock"]
//!
//! [run]
//! iterations = 1000
//! window_secs = 5
//! checkpoint_granularity = 10
//! first_block = 0
//! last_block = 60000000
//! poll_interval_ms = 100
//! progress_pattern = 'Track: block (\d+)'
//! failure_tokens = ["exit status", "fail"]
//! ```

use crate::supervisor::CommandSpec;
use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-run directory created under the tmp directory.
pub const WORK_DIR_NAME: &str = "db-heal-test";

pub const DEFAULT_PROGRESS_PATTERN: &str = r"Track: block (\d+)";

/// Placeholder in `sync_args` that expands to `resume_args` on resumed runs
/// and to nothing on the bootstrap run.
pub const RESUME_ARGS_PLACEHOLDER: &str = "{resume_args}";

fn default_sync_program() -> String {
    "{tool_root}/build/aida-vm-sdb".to_string()
}

fn default_sync_args() -> Vec<String> {
    [
        "substate",
        "--validate",
        "--db-tmp",
        "{db_tmp}",
        "--carmen-schema",
        "5",
        "--db-impl",
        "carmen",
        "--aida-db",
        "{source_db}",
        "--no-heartbeat-logging",
        "--track-progress",
        "--archive",
        "--archive-variant",
        "s5",
        "--archive-query-rate",
        "200",
        "--carmen-checkpoint-interval",
        "{granularity}",
        "--tracker-granularity",
        "{granularity}",
        RESUME_ARGS_PLACEHOLDER,
        "{first_block}",
        "{last_block}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_resume_args() -> Vec<String> {
    vec![
        "--db-src".to_string(),
        "{db_src}".to_string(),
        "--skip-priming".to_string(),
    ]
}

fn default_db_tool_program() -> String {
    "go".to_string()
}

fn default_db_tool_args() -> Vec<String> {
    vec!["run".to_string(), "./database/mpt/tool".to_string()]
}

fn default_db_tool_dir() -> PathBuf {
    PathBuf::from("go")
}

fn default_reset_flags() -> Vec<String> {
    vec!["--force-unlock".to_string()]
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_progress_pattern() -> String {
    DEFAULT_PROGRESS_PATTERN.to_string()
}

fn default_failure_tokens() -> Vec<String> {
    vec!["exit status".to_string(), "fail".to_string()]
}

/// `[tools]` section: how the external programs are invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_sync_program")]
    pub sync_program: String,
    #[serde(default = "default_sync_args")]
    pub sync_args: Vec<String>,
    #[serde(default = "default_resume_args")]
    pub resume_args: Vec<String>,
    #[serde(default = "default_db_tool_program")]
    pub db_tool_program: String,
    #[serde(default = "default_db_tool_args")]
    pub db_tool_args: Vec<String>,
    /// Working directory for database-tool invocations, relative paths are
    /// resolved against the directory the harness was started in.
    #[serde(default = "default_db_tool_dir")]
    pub db_tool_dir: PathBuf,
    #[serde(default = "default_reset_flags")]
    pub reset_flags: Vec<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            sync_program: default_sync_program(),
            sync_args: default_sync_args(),
            resume_args: default_resume_args(),
            db_tool_program: default_db_tool_program(),
            db_tool_args: default_db_tool_args(),
            db_tool_dir: default_db_tool_dir(),
            reset_flags: default_reset_flags(),
        }
    }
}

/// `[run]` section. Unset values fall back to the CLI defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default)]
    pub iterations: Option<u32>,
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub checkpoint_granularity: Option<u64>,
    #[serde(default)]
    pub first_block: Option<u64>,
    #[serde(default)]
    pub last_block: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_progress_pattern")]
    pub progress_pattern: String,
    #[serde(default = "default_failure_tokens")]
    pub failure_tokens: Vec<String>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            iterations: None,
            window_secs: None,
            checkpoint_granularity: None,
            first_block: None,
            last_block: None,
            poll_interval_ms: default_poll_interval_ms(),
            progress_pattern: default_progress_pattern(),
            failure_tokens: default_failure_tokens(),
        }
    }
}

/// Contents of the optional TOML configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealToml {
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub run: RunSection,
}

impl HealToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Values supplied on the command line (or through their env fallbacks).
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub tool_root: Option<PathBuf>,
    pub source_db: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
    pub iterations: Option<u32>,
    pub window_secs: Option<u64>,
    pub checkpoint_granularity: Option<u64>,
    pub first_block: Option<u64>,
    pub last_block: Option<u64>,
    pub append_logs: bool,
}

/// Template for the sync binary's command line.
#[derive(Debug, Clone)]
pub struct SyncCommand {
    pub program: String,
    pub args: Vec<String>,
    pub resume_args: Vec<String>,
}

/// Per-launch values substituted into the [`SyncCommand`] template.
#[derive(Debug, Clone)]
pub struct SyncInvocation<'a> {
    pub db_tmp: &'a Path,
    /// Working database to resume from; `None` on the bootstrap run.
    pub db_src: Option<&'a Path>,
    pub first_block: u64,
    pub last_block: u64,
}

impl SyncCommand {
    pub fn render(&self, config: &HealConfig, inv: &SyncInvocation<'_>) -> CommandSpec {
        let vars = [
            ("tool_root", config.tool_root.display().to_string()),
            ("source_db", config.source_db.display().to_string()),
            ("db_tmp", inv.db_tmp.display().to_string()),
            (
                "db_src",
                inv.db_src
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            ("granularity", config.checkpoint_granularity.to_string()),
            ("first_block", inv.first_block.to_string()),
            ("last_block", inv.last_block.to_string()),
        ];

        let mut args = Vec::with_capacity(self.args.len() + self.resume_args.len());
        for arg in &self.args {
            if arg == RESUME_ARGS_PLACEHOLDER {
                if inv.db_src.is_some() {
                    args.extend(self.resume_args.iter().map(|a| expand(a, &vars)));
                }
                continue;
            }
            args.push(expand(arg, &vars));
        }

        CommandSpec {
            program: expand(&self.program, &vars),
            args,
            working_dir: None,
        }
    }
}

/// How database-tool subcommands are invoked.
#[derive(Debug, Clone)]
pub struct DbToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub reset_flags: Vec<String>,
}

impl DbToolCommand {
    /// Command for one subcommand, e.g. `reset --force-unlock <archive> <block>`.
    pub fn subcommand<I, S>(&self, name: &str, rest: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = self.args.clone();
        args.push(name.to_string());
        args.extend(rest.into_iter().map(Into::into));
        CommandSpec {
            program: self.program.clone(),
            args,
            working_dir: Some(self.working_dir.clone()),
        }
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct HealConfig {
    pub tool_root: PathBuf,
    pub source_db: PathBuf,
    pub tmp_dir: PathBuf,
    pub iterations: u32,
    pub kill_window: Duration,
    pub checkpoint_granularity: u64,
    pub first_block: u64,
    pub last_block: u64,
    pub poll_interval: Duration,
    pub progress_pattern: Regex,
    pub failure_tokens: Vec<String>,
    pub append_logs: bool,
    pub sync: SyncCommand,
    pub db_tool: DbToolCommand,
}

impl HealConfig {
    pub const DEFAULT_ITERATIONS: u32 = 1000;
    pub const DEFAULT_WINDOW_SECS: u64 = 5;
    pub const DEFAULT_GRANULARITY: u64 = 10;
    pub const DEFAULT_LAST_BLOCK: u64 = 60_000_000;

    /// Merge file settings with CLI overrides and validate the result.
    pub fn resolve(file: HealToml, cli: CliOverrides) -> Result<Self> {
        let Some(tool_root) = cli.tool_root else {
            bail!("please set the tool root using --aida");
        };
        let Some(source_db) = cli.source_db else {
            bail!("please set the source database using --aida-db");
        };
        let tmp_dir = cli.tmp_dir.unwrap_or_else(std::env::temp_dir);

        let run = file.run;
        let iterations = cli
            .iterations
            .or(run.iterations)
            .unwrap_or(Self::DEFAULT_ITERATIONS);
        let window_secs = cli
            .window_secs
            .or(run.window_secs)
            .unwrap_or(Self::DEFAULT_WINDOW_SECS);
        let checkpoint_granularity = cli
            .checkpoint_granularity
            .or(run.checkpoint_granularity)
            .unwrap_or(Self::DEFAULT_GRANULARITY);
        let first_block = cli.first_block.or(run.first_block).unwrap_or(0);
        let last_block = cli
            .last_block
            .or(run.last_block)
            .unwrap_or(Self::DEFAULT_LAST_BLOCK);

        if window_secs == 0 {
            bail!("--window must be at least one second");
        }
        if checkpoint_granularity == 0 {
            bail!("--cp-granularity must be at least one block");
        }
        if first_block > last_block {
            bail!(
                "first block {} is beyond last block {}",
                first_block,
                last_block
            );
        }

        let progress_pattern = Regex::new(&run.progress_pattern)
            .with_context(|| format!("Invalid progress pattern '{}'", run.progress_pattern))?;
        if progress_pattern.captures_len() < 2 {
            bail!(
                "progress pattern '{}' must capture the block number",
                run.progress_pattern
            );
        }

        let tools = file.tools;
        let db_tool_dir = if tools.db_tool_dir.is_absolute() {
            tools.db_tool_dir
        } else {
            std::env::current_dir()
                .context("Failed to get current directory")?
                .join(tools.db_tool_dir)
        };

        Ok(Self {
            tool_root,
            source_db,
            tmp_dir,
            iterations,
            kill_window: Duration::from_secs(window_secs),
            checkpoint_granularity,
            first_block,
            last_block,
            poll_interval: Duration::from_millis(run.poll_interval_ms.max(1)),
            progress_pattern,
            failure_tokens: run.failure_tokens,
            append_logs: cli.append_logs,
            sync: SyncCommand {
                program: tools.sync_program,
                args: tools.sync_args,
                resume_args: tools.resume_args,
            },
            db_tool: DbToolCommand {
                program: tools.db_tool_program,
                args: tools.db_tool_args,
                working_dir: db_tool_dir,
                reset_flags: tools.reset_flags,
            },
        })
    }

    /// Root that holds every working database, log and snapshot of a run.
    pub fn work_root(&self) -> PathBuf {
        self.tmp_dir.join(WORK_DIR_NAME)
    }
}

/// Replace `{name}` placeholders with their values.
fn expand(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        let key = format!("{{{}}}", name);
        if out.contains(&key) {
            out = out.replace(&key, value);
        }
    }
    out
}
