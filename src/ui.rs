use chrono::TimeDelta;
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

/// Print a key-value pair, right-aligning keys to `width`
pub fn kv(key: &str, value: &str, width: usize) {
    println!("  {}: {}", format!("{key:>width$}").dimmed(), value);
}

/// Color a task result or state by how good it is
pub fn by_status(status: &str) -> ColoredString {
    colored_by(status, status)
}

/// Color `text` the way `status` would be colored
pub fn colored_by(status: &str, text: &str) -> ColoredString {
    match status.to_lowercase().as_str() {
        "success" | "stopped" => text.green(),
        "warning" | "paused" => text.yellow(),
        "pending" | "running" | "scheduled" => text.blue(),
        _ => text.red(),
    }
}

/// Format a duration as `H:MM:SS`
pub fn format_duration(duration: TimeDelta) -> String {
    let total = duration.num_seconds();
    let sign = if total < 0 { "-" } else { "" };
    let total = total.unsigned_abs();
    format!(
        "{sign}{}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

// ============================================================================
// Tests
// ============================================================================
