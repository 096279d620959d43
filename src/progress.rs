//! Progress bars for table inserts.

use indicatif::{ProgressBar, ProgressStyle};

/// Row-based progress bar for loading `table`, or `None` when disabled.
pub fn row_progress(enabled: bool, total_rows: usize, table: &str) -> Option<ProgressBar> {
    if !enabled {
        return None;
    }
    let pb = ProgressBar::new(total_rows as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} rows ({percent}%) {msg}",
    ) {
        pb.set_style(
            style
                .progress_chars("█▓▒░  ")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
    }
    pb.set_message(table.to_string());
    Some(pb)
}
