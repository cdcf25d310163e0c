//! Copy progress and size display.

use indicatif::{BinaryBytes, ProgressBar, ProgressStyle};
use std::time::Duration;

const TEMPLATE: &str =
    "{prefix:.bold} {bar:40.cyan/blue} {binary_bytes}/{binary_total_bytes} {binary_bytes_per_sec} eta {eta}";

/// Byte counter over a copy, drawn on stderr unless disabled
pub struct CopyProgress {
    bar: ProgressBar,
}

impl CopyProgress {
    #[must_use]
    pub fn new(size: u64, name: &str, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(size)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::with_template(TEMPLATE) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_prefix(name.to_string());
        Self { bar }
    }

    /// Count `bytes` more as written
    pub fn advance(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    pub fn finish(&self) {
        self.bar.finish();
    }

    /// Leave the bar where the copy stopped
    pub fn fail(&self) {
        self.bar.abandon_with_message("failed");
    }
}

/// Binary-prefixed size, e.g. `1.50 KiB`
#[must_use]
pub fn format_size(bytes: u64) -> String {
    BinaryBytes(bytes).to_string()
}

/// Throughput of `bytes` moved over `elapsed`
#[must_use]
pub fn format_rate(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return "-".to_string();
    }
    format!("{}/s", format_size((bytes as f64 / secs) as u64))
}
