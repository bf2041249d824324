use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser, Debug)]
#[command(name = "dbheal")]
#[command(
    version,
    about = "Crash-recovery test harness: kill a syncing database, roll it back, resume"
)]
pub struct Cli {
    /// Root of the tool checkout holding the sync binary and the database tool
    #[arg(long = "tool-root", visible_alias = "aida", env = "DBHEAL_TOOL_ROOT")]
    pub tool_root: Option<PathBuf>,

    /// Source database the sync process replays from
    #[arg(long = "source-db", visible_alias = "aida-db", env = "DBHEAL_SOURCE_DB")]
    pub source_db: Option<PathBuf>,

    /// Directory under which the db-heal-test working root is created
    #[arg(long, env = "DBHEAL_TMP")]
    pub tmp: Option<PathBuf>,

    /// Number of crash/recover/resume iterations
    #[arg(long = "iter")]
    pub iterations: Option<u32>,

    /// Seconds the sync process runs after its first progress line before it is killed
    #[arg(long)]
    pub window: Option<u64>,

    /// Checkpoint interval of the archive, in blocks
    #[arg(long = "cp-granularity")]
    pub cp_granularity: Option<u64>,

    #[arg(long)]
    pub first_block: Option<u64>,

    #[arg(long)]
    pub last_block: Option<u64>,

    /// TOML file describing the external programs and run defaults
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write a JSON run report here once the run ends
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Keep appending to the harness logs instead of truncating them per iteration
    #[arg(long)]
    pub append_logs: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit diagnostics as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Only print results and failure dumps
    #[arg(short, long)]
    pub quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    cmd::init_tracing(cli.verbose, cli.json_logs);

    let success = cmd::run_harness(&cli).await?;
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
