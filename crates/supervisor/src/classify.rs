//! Classification of child output lines.
//!
//! Installer tools print lines such as
//! `[ INFO 2024-01-01T10:00:00 verbose] Running puppet`, often decorated with
//! ANSI colors. Lines are stripped of escape sequences, then either parsed
//! for their embedded level or assigned the default level of the stream they
//! were read from.

use log::Level;
use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ANSI pattern is valid")
});

static STRUCTURED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[ (?P<level>INFO|WARN|ERROR|DEBUG) \d{4}-\d{1,2}-\d{1,2}[T\s]\d{1,2}:\d{1,2}:\d{2} verbose\] (?P<message>.*)",
    )
    .expect("structured line pattern is valid")
});

/// Output stream a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    /// Level for lines without an embedded level.
    pub fn default_level(self) -> Level {
        match self {
            Self::Stdout => Level::Info,
            Self::Stderr => Level::Error,
        }
    }
}

/// A classified output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub message: String,
}

/// Remove ANSI escape sequences.
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(line, "")
}

fn parse_level(name: &str) -> Option<Level> {
    match name {
        "DEBUG" => Some(Level::Debug),
        "INFO" => Some(Level::Info),
        "WARN" => Some(Level::Warn),
        "ERROR" => Some(Level::Error),
        _ => None,
    }
}

/// Classify one raw line read from `stream`.
pub fn classify(raw: &str, stream: Stream) -> LogLine {
    let line = strip_ansi(raw);
    if let Some(caps) = STRUCTURED_LINE.captures(&line) {
        if let Some(level) = caps.name("level").and_then(|m| parse_level(m.as_str())) {
            return LogLine {
                level,
                message: caps["message"].to_string(),
            };
        }
    }
    LogLine {
        level: stream.default_level(),
        message: line.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_line() {
        let line = classify("[ INFO 2024-01-01T10:00:00 verbose] Hello", Stream::Stdout);
        assert_eq!(line.level, Level::Info);
        assert_eq!(line.message, "Hello");
    }

    #[test]
    fn test_structured_level_wins_on_stderr() {
        let line = classify("[ WARN 2024-1-1 9:05:00 verbose] disk low", Stream::Stderr);
        assert_eq!(line.level, Level::Warn);
        assert_eq!(line.message, "disk low");
    }

    #[test]
    fn test_unstructured_uses_stream_default() {
        let err = classify("something broke", Stream::Stderr);
        assert_eq!(err.level, Level::Error);
        assert_eq!(err.message, "something broke");

        let out = classify("Installing packages", Stream::Stdout);
        assert_eq!(out.level, Level::Info);
    }

    #[test]
    fn test_ansi_is_stripped_before_parsing() {
        let raw = "\x1b[0;32m[ DEBUG 2024-01-01 10:00:00 verbose] \x1b[1mapplied\x1b[0m";
        let line = classify(raw, Stream::Stdout);
        assert_eq!(line.level, Level::Debug);
        assert_eq!(line.message, "applied");
    }

    #[test]
    fn test_strip_ansi_leaves_plain_text() {
        assert_eq!(strip_ansi("plain"), "plain");
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m text"), "red text");
    }

    #[test]
    fn test_malformed_timestamp_is_unstructured() {
        let line = classify("[ INFO yesterday verbose] Hello", Stream::Stdout);
        assert_eq!(line.level, Level::Info);
        assert_eq!(line.message, "[ INFO yesterday verbose] Hello");
    }
}
