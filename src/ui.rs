use bulkops::Outcome;
use chrono::{DateTime, Local, Utc};
use colored::{ColoredString, Colorize};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Formatting
// ============================================================================

/// Render an optional timestamp in local time, or `-`
pub fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(
        || "-".to_string(),
        |at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
    )
}

/// Yes/no marker for boolean columns
pub fn flag(value: bool) -> ColoredString {
    if value { "yes".green() } else { "no".dimmed() }
}

/// Colored one-word label for an execution outcome
pub fn outcome_label(outcome: &Outcome) -> ColoredString {
    match outcome {
        Outcome::Previewed { ready: Some(true) } => "previewed (ready)".green(),
        Outcome::Previewed { ready: Some(false) | None } => "previewed".cyan(),
        Outcome::Applied => "applied".green().bold(),
        Outcome::Refused => "refused".yellow(),
        Outcome::Failed { .. } => "failed".red().bold(),
        Outcome::Missing => "missing".yellow(),
        Outcome::Skipped => "skipped".dimmed(),
    }
}

/// Shorten a keypath for display, keeping the end
pub fn truncate_keypath(keypath: &str, max_len: usize) -> String {
    let len = keypath.chars().count();
    if len <= max_len {
        keypath.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let tail: String = keypath.chars().skip(len - (max_len - 3)).collect();
        format!("...{tail}")
    }
}

// ============================================================================
// Tests
// ============================================================================
