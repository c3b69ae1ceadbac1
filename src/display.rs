//! Colored CLI output for tool responses.

use std::collections::BTreeMap;
use std::io::{self, Write};

use owo_colors::OwoColorize;

use crate::metadata::WriteOutcome;
use crate::protocol::ResponseBatch;

/// Width of the tag column, capped so long names do not push values off screen.
const MAX_KEY_WIDTH: usize = 32;

/// Truncate a string to a maximum length, adding ellipsis if truncated.
#[must_use]
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

/// Print tags as an aligned two-column table.
pub fn print_tags(tags: &BTreeMap<String, String>) {
    let width = tags
        .keys()
        .map(|k| k.chars().count())
        .max()
        .unwrap_or(0)
        .min(MAX_KEY_WIDTH);
    for (key, value) in tags {
        let key = truncate(key, MAX_KEY_WIDTH);
        println!("{:<width$} {}", key.cyan(), value);
    }
    let _ = io::stdout().flush();
}

/// Print raw response lines.
pub fn print_batch(batch: &ResponseBatch) {
    for line in batch.lines() {
        println!("{line}");
    }
    let _ = io::stdout().flush();
}

/// Print the result of a write.
pub fn print_write_outcome(outcome: &WriteOutcome) {
    println!(
        "{} {} updated, {} unchanged",
        "[WRITE]".green().bold(),
        outcome.updated,
        outcome.unchanged
    );
    let _ = io::stdout().flush();
}

/// Print an error to stderr.
pub fn print_error(err: &dyn std::error::Error) {
    eprintln!("{} {}", "[ERROR]".red().bold(), err);
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("        {} {}", "caused by:".dimmed(), cause);
        source = cause.source();
    }
}
