//! Progress bars for batch runs

use crate::ui;
use bulkops::{Outcome, ProgressCallback};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const TEMPLATE: &str = "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// indicatif-backed [`ProgressCallback`]
///
/// Failures and refusals are printed above the bar as they happen so they
/// are visible before the summary.
pub struct BatchProgress {
    bar: ProgressBar,
    quiet: bool,
}

impl BatchProgress {
    pub fn new(quiet: bool) -> Self {
        Self {
            bar: ProgressBar::hidden(),
            quiet,
        }
    }
}

impl ProgressCallback for BatchProgress {
    fn on_batch_start(&mut self, count: usize) {
        if self.quiet || count == 0 {
            return;
        }
        self.bar = ProgressBar::with_draw_target(Some(count as u64), ProgressDrawTarget::stderr());
        self.bar.set_style(
            ProgressStyle::default_bar()
                .template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
    }

    fn on_service_start(&mut self, keypath: &str) {
        self.bar.set_message(ui::truncate_keypath(keypath, 40));
    }

    fn on_service_complete(&mut self, keypath: &str, outcome: &Outcome) {
        if !outcome.is_success() && !self.quiet {
            self.bar
                .println(format!("  {} {keypath}", ui::outcome_label(outcome)));
        }
        self.bar.inc(1);
    }

    fn on_batch_complete(&mut self) {
        self.bar.finish_and_clear();
    }
}
