//! Operator narrative for a harness run.
//!
//! Progress through the iterations is shown on an `indicatif` bar when
//! stderr is a terminal. Narrative lines always reach stdout: through the
//! bar when it is drawn, directly otherwise.

use crate::config::HealConfig;
use console::style;
use dbheal_common::Checkpoint;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

pub struct HarnessUi {
    bar: ProgressBar,
    quiet: bool,
}

impl HarnessUi {
    /// `quiet` suppresses the step narrative; results and failure dumps are
    /// still printed.
    pub fn new(iterations: u32, quiet: bool) -> Self {
        let bar = ProgressBar::with_draw_target(
            Some(u64::from(iterations)),
            ProgressDrawTarget::stderr(),
        );
        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg} ({elapsed})")
        {
            bar.set_style(bar_style.progress_chars("=> "));
        }
        bar.set_prefix("Iterations");
        Self { bar, quiet }
    }

    /// A UI that draws nothing and prints only results.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            quiet: true,
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.bar.is_hidden() {
            println!("{}", msg.as_ref());
        } else {
            self.bar.println(msg.as_ref());
        }
    }

    fn step(&self, msg: impl AsRef<str>) {
        if !self.quiet {
            self.print_line(msg);
        }
    }

    pub fn settings(&self, config: &HealConfig) {
        self.step("Your settings:");
        self.step(format!("\tNumber of iterations: {}.", config.iterations));
        self.step(format!(
            "\tSync time before kill: {} seconds.",
            config.kill_window.as_secs()
        ));
        self.step(format!(
            "\tCheckpoint granularity: {} blocks.",
            config.checkpoint_granularity
        ));
        self.bar.enable_steady_tick(Duration::from_millis(200));
    }

    pub fn bootstrapping(&self) {
        self.step("Creating database with the sync process...");
        self.bar.set_message("bootstrapping");
    }

    pub fn sync_restarted(&self, first_block: u64) {
        self.step(format!("Restarting sync from block {}...", first_block));
        self.bar.set_message(format!("syncing from {}", first_block));
    }

    pub fn interrupted(&self, last_seen: Checkpoint) {
        self.step(format!(
            "Interrupting... (last checkpoint seen in log: {})",
            last_seen
        ));
    }

    pub fn loop_started(&self) {
        self.step("Testing db created, starting loop.");
    }

    pub fn recovering(&self, iteration: u32, total: u32, candidate: Checkpoint) {
        self.step(format!(
            "{} Iteration {}/{}: using checkpoint on block {}.",
            style(">").cyan(),
            iteration,
            total,
            candidate
        ));
        self.bar.set_message(format!("recovering to {}", candidate));
    }

    pub fn fallback(&self, candidate: Checkpoint, recovered: Checkpoint) {
        self.step(format!(
            "{} Reset to block {} rejected, archive reports checkpoint {}.",
            style("!").yellow(),
            candidate,
            recovered
        ));
    }

    pub fn recovered(&self, checkpoint: Checkpoint) {
        self.step(format!(
            "Restoration complete. LiveDB rebuilt from genesis at block {}.",
            checkpoint
        ));
    }

    pub fn iteration_done(&self) {
        self.bar.inc(1);
    }

    pub fn cleaning(&self, root: &std::path::Path) {
        self.step(format!("Clearing work directory {}.", root.display()));
    }

    /// Print a captured log verbatim.
    pub fn dump_log(&self, title: &str, log: &str) {
        self.print_line(format!("{}", style(title).red().bold()));
        self.print_line(log.trim_end());
    }

    pub fn finish(&self, success: bool, detail: &str) {
        self.bar.finish_and_clear();
        if success {
            println!("{} {}", style("Success!").green().bold(), detail);
        } else {
            println!("{} {}", style("Fail").red().bold(), detail);
        }
    }
}
