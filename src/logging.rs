//! Screen logging plus a per-server transcript file.
//!
//! The screen follows `-v`/`-q`. The transcript always records Debug, so a
//! failed install can be read back after the terminal scrolled away.

use anyhow::{Context as _, Result};
use env_logger::fmt::Formatter;
use env_logger::{Builder, Logger, Target, WriteStyle};
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Transcript file for a server, in the current directory.
pub fn transcript_path(server_name: &str) -> PathBuf {
    PathBuf::from(format!("{server_name}.log"))
}

/// Open a transcript for appending.
pub fn open_transcript(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Could not open log file {}", path.display()))
}

pub fn screen(level: LevelFilter, step_level: LevelFilter) -> Logger {
    Builder::new()
        .filter_level(level)
        .filter_module(supervisor::STEP_TARGET, step_level)
        .format(format)
        .build()
}

pub fn transcript(file: File) -> Logger {
    Builder::new()
        .filter_level(LevelFilter::Debug)
        .target(Target::Pipe(Box::new(file)))
        .write_style(WriteStyle::Never)
        .format(format)
        .build()
}

/// Install the loggers as the global `log` backend.
pub fn install(screen: Logger, transcript: Option<Logger>) -> Result<()> {
    let tee = Tee { screen, transcript };
    log::set_max_level(tee.max_level());
    log::set_boxed_logger(Box::new(tee)).context("A logger is already installed")
}

fn format(buf: &mut Formatter, record: &Record<'_>) -> io::Result<()> {
    writeln!(
        buf,
        "[{} {:<5}] {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        record.level(),
        record.args()
    )
}

/// Sends each record to every logger whose filter accepts it.
struct Tee {
    screen: Logger,
    transcript: Option<Logger>,
}

impl Tee {
    fn max_level(&self) -> LevelFilter {
        self.transcript
            .as_ref()
            .map_or(self.screen.filter(), |t| t.filter().max(self.screen.filter()))
    }
}

impl Log for Tee {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.screen.enabled(metadata)
            || self
                .transcript
                .as_ref()
                .is_some_and(|t| t.enabled(metadata))
    }

    fn log(&self, record: &Record<'_>) {
        self.screen.log(record);
        if let Some(transcript) = &self.transcript {
            transcript.log(record);
        }
    }

    fn flush(&self) {
        self.screen.flush();
        if let Some(transcript) = &self.transcript {
            transcript.flush();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    fn emit(tee: &Tee, level: Level, target: &str, message: &str) {
        tee.log(
            &Record::builder()
                .args(format_args!("{message}"))
                .level(level)
                .target(target)
                .build(),
        );
    }

    #[test]
    fn test_transcript_keeps_debug_hidden_from_screen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(transcript_path("lab"));
        let tee = Tee {
            screen: screen(LevelFilter::Error, LevelFilter::Error),
            transcript: Some(transcript(open_transcript(&path).unwrap())),
        };
        assert_eq!(tee.max_level(), LevelFilter::Debug);

        emit(&tee, Level::Debug, "forge", "searching organizations");
        emit(&tee, Level::Info, supervisor::STEP_TARGET, "Installing package");
        emit(&tee, Level::Trace, "forge", "wire bytes");
        tee.flush();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("DEBUG] searching organizations"));
        assert!(content.contains("INFO ] Installing package"));
        assert!(!content.contains("wire bytes"));
    }

    #[test]
    fn test_transcript_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.log");
        std::fs::write(&path, "earlier run\n").unwrap();

        let tee = Tee {
            screen: screen(LevelFilter::Off, LevelFilter::Off),
            transcript: Some(transcript(open_transcript(&path).unwrap())),
        };
        emit(&tee, Level::Warn, "forge", "second run");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("earlier run\n"));
        assert!(content.contains("WARN ] second run"));
    }

    #[test]
    fn test_screen_only_level() {
        let tee = Tee {
            screen: screen(LevelFilter::Info, LevelFilter::Info),
            transcript: None,
        };
        assert_eq!(tee.max_level(), LevelFilter::Info);
        assert_eq!(transcript_path("sat6"), PathBuf::from("sat6.log"));
    }
}
