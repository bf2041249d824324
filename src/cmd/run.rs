//! `dbheal` run: resolve settings, drive the orchestrator, report.

use anyhow::Result;
use chrono::Utc;
use dbheal::config::{CliOverrides, HealConfig, HealToml};
use dbheal::orchestrator::{IterationOrchestrator, RunSummary, TOOL_LOG, Termination};
use dbheal::recovery::CommandDbTool;
use dbheal::report::RunReport;
use dbheal::ui::HarnessUi;

use super::super::Cli;

pub fn resolve_config(cli: &Cli) -> Result<HealConfig> {
    let file = match &cli.config {
        Some(path) => HealToml::load(path)?,
        None => HealToml::default(),
    };
    HealConfig::resolve(
        file,
        CliOverrides {
            tool_root: cli.tool_root.clone(),
            source_db: cli.source_db.clone(),
            tmp_dir: cli.tmp.clone(),
            iterations: cli.iterations,
            window_secs: cli.window,
            checkpoint_granularity: cli.cp_granularity,
            first_block: cli.first_block,
            last_block: cli.last_block,
            append_logs: cli.append_logs,
        },
    )
}

/// Returns whether the run ended successfully.
pub async fn run_harness(cli: &Cli) -> Result<bool> {
    let config = resolve_config(cli)?;
    let ui = HarnessUi::new(config.iterations, cli.quiet);
    ui.settings(&config);

    let tool = CommandDbTool::new(
        config.db_tool.clone(),
        config.work_root().join(TOOL_LOG),
        config.append_logs,
    );

    let started_at = Utc::now();
    tracing::info!(
        iterations = config.iterations,
        window_secs = config.kill_window.as_secs(),
        granularity = config.checkpoint_granularity,
        work_root = %config.work_root().display(),
        "starting run"
    );
    let summary = IterationOrchestrator::new(&config, &tool, &ui).run().await;

    if let Some(path) = &cli.report {
        if let Err(e) = RunReport::new(&config, started_at, &summary).write(path) {
            tracing::error!(error = %e, "run report not written");
        }
    }

    report_outcome(&ui, &summary);
    Ok(summary.is_success())
}

fn report_outcome(ui: &HarnessUi, summary: &RunSummary) {
    match &summary.termination {
        Termination::IterationsExhausted { iterations } => {
            ui.finish(true, &format!("{} iterations completed.", iterations));
        }
        Termination::SyncCompleted { checkpoint } => {
            ui.finish(
                true,
                &format!(
                    "Sync reached block {} after {} iterations.",
                    checkpoint,
                    summary.completed_iterations()
                ),
            );
        }
        Termination::Failure { reason, log } => {
            if let Some(log) = log {
                ui.dump_log("Captured log of the failing command:", log);
            }
            ui.finish(false, reason);
        }
    }
}
