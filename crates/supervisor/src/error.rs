//! Error types for supervised steps.

use std::io;
use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while starting or observing a step.
///
/// A step that runs and exits non-zero is not an error: it ends the program
/// through the configured terminator instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The command vector was empty.
    #[error("step '{step}' has an empty command")]
    EmptyCommand {
        /// Step name
        step: String,
    },

    /// The child could not be spawned.
    #[error("failed to start '{command}': {source}")]
    Spawn {
        /// Program that failed to start
        command: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// `observe` was called with no running step.
    #[error("no step is running")]
    NotRunning,

    /// `start` was called while a step is still running.
    #[error("step '{0}' is still running")]
    AlreadyRunning(String),

    /// Waiting on or reading from the child failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error happened before the child existed.
    pub fn is_startup(&self) -> bool {
        matches!(self, Self::EmptyCommand { .. } | Self::Spawn { .. })
    }
}
