use asynchy::ProgressSink;
use indicatif::{ProgressBar, ProgressStyle};

/// Byte progress drawn on the terminal.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent}% ({bytes}/{total_bytes}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { bar }
    }
}

impl ProgressSink for BarProgress {
    fn start(&mut self, total: u64) {
        self.bar.set_length(total);
    }

    fn advance(&mut self, delta: u64) {
        self.bar.inc(delta);
    }

    fn finish(&mut self) {
        self.bar.finish_with_message("done");
    }
}
