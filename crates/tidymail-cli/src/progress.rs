use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tidymail_core::{ProgressSample, ProgressSink};

/// Renders progress samples as a terminal bar.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(message: &str, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        {
            bar.set_style(style.progress_chars("##-"));
        }
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    #[cfg(test)]
    fn position(&self) -> (u64, Option<u64>) {
        (self.bar.position(), self.bar.length())
    }
}

impl ProgressSink for BarProgress {
    fn report(&self, sample: ProgressSample) {
        self.bar.set_length(sample.total as u64);
        self.bar.set_position(sample.completed as u64);
        if let Some(eta) = sample.eta_secs() {
            self.bar
                .set_message(format!("{:.1}/s, ~{:.0}s left", sample.rate, eta));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_move_the_bar() {
        let progress = BarProgress::new("scan", false);
        progress.report(ProgressSample {
            fraction: 0.3,
            completed: 3,
            total: 10,
            rate: 1.5,
            elapsed_secs: 2.0,
        });
        assert_eq!(progress.position(), (3, Some(10)));
        progress.finish();
    }
}
