//! Progress bar utilities for stage pools

use indicatif::{ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})";

/// Create a progress bar for `total` units with a message above it.
pub fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// Format a duration in milliseconds as `1m 02.345s` or `2.345s`.
pub fn format_elapsed(ms: u128) -> String {
    let minutes = ms / 60_000;
    let seconds = (ms % 60_000) as f64 / 1000.0;
    if minutes > 0 {
        format!("{}m {:06.3}s", minutes, seconds)
    } else {
        format!("{:.3}s", seconds)
    }
}
