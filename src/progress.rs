//! Progress indicators for stagehand CLI.
//!
//! Pipeline phases are shown as spinners; when several stages deploy at
//! once their spinners share one [`MultiProgress`].

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use releasekit::Error;
use releasekit::context::ProgressCallback;
use std::time::Duration;

use crate::ui;

/// Create a spinner with a message.
pub fn spinner(msg: impl Into<String>) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(spinner_style());
    bar.set_message(msg.into());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Reports pipeline phases of one stage.
pub struct PhaseProgress {
    stage: String,
    multi: Option<MultiProgress>,
    bar: Option<ProgressBar>,
    quiet: bool,
}

impl PhaseProgress {
    /// Progress for a single stage.
    pub fn new(stage: impl Into<String>, quiet: bool) -> Self {
        Self {
            stage: stage.into(),
            multi: None,
            bar: None,
            quiet,
        }
    }

    /// Progress drawn alongside other stages.
    pub fn shared(stage: impl Into<String>, multi: MultiProgress, quiet: bool) -> Self {
        Self {
            stage: stage.into(),
            multi: Some(multi),
            bar: None,
            quiet,
        }
    }

    fn emit(&self, line: &str) {
        if self.quiet {
            return;
        }
        match &self.multi {
            Some(multi) => {
                let _ = multi.println(line);
            }
            None => println!("{line}"),
        }
    }

    fn clear(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl ProgressCallback for PhaseProgress {
    fn on_phase_start(&mut self, index: usize, total: usize, name: &str) {
        self.clear();
        if self.quiet {
            return;
        }
        let msg = format!("[{}] [{}/{}] {name}", self.stage, index + 1, total);
        let bar = spinner(msg);
        self.bar = Some(match &self.multi {
            Some(multi) => multi.add(bar),
            None => bar,
        });
    }

    fn on_phase_complete(&mut self, name: &str, elapsed: Duration) {
        self.clear();
        self.emit(&format!(
            "  {} [{}] {name} {}",
            "✓".green(),
            self.stage,
            ui::format_duration(elapsed).dimmed()
        ));
    }

    fn on_phase_failed(&mut self, name: &str, error: &Error) {
        self.clear();
        self.emit(&format!("  {} [{}] {name}: {error}", "✗".red(), self.stage));
    }

    fn on_hook(&mut self, name: &str) {
        self.clear();
        self.emit(&format!("  {} [{}] {name}", "↺".yellow(), self.stage));
    }
}

impl Drop for PhaseProgress {
    fn drop(&mut self) {
        self.clear();
    }
}
