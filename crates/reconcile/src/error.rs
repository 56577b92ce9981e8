//! Error types for remote API operations.
//!
//! Errors are categorized so the reconciler can decide, once per response,
//! whether a failed mutation is recoverable (conflict, lock, soft timeout),
//! a plain HTTP failure scoped to one entity, or something unexpected that
//! must stop the whole run.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Result type alias for remote API operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Message returned by the server when a background task holds the lock.
pub const LOCK_MESSAGE: &str = "Required lock is already taken by other running tasks";

/// Marker returned by the server when a synchronous wait on a task timed out.
pub const SYNC_TIMEOUT_MARKER: &str = "foreman_tasks_sync_task_timeout";

static LOCK_OWNER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/foreman_tasks/tasks/([a-z0-9\-]+)").expect("lock owner pattern is valid")
});

/// Categories of remote errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The entity already exists (409/422).
    Conflict,
    /// Another background task holds the lock on the resource.
    Locked,
    /// The server gave up waiting on a background task; work continues remotely.
    SoftTimeout,
    /// Nothing matched the request (404).
    NotFound,
    /// Any other HTTP status error.
    Http,
    /// Connection, TLS or protocol failure before a status was received.
    Transport,
    /// The response could not be decoded.
    Format,
    /// Other/unknown errors.
    Other,
}

impl ErrorCategory {
    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Conflict => "Entity already exists",
            Self::Locked => "Resource locked by a running task",
            Self::SoftTimeout => "Background task still running",
            Self::NotFound => "Nothing matched the request",
            Self::Http => "Request rejected by the server",
            Self::Transport => "Could not reach the server",
            Self::Format => "Unexpected response format",
            Self::Other => "Unexpected error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Conflict => "The entity will be updated instead of created",
            Self::Locked => "Wait for the blocking task, or resume it if it is paused",
            Self::SoftTimeout => "Check the task list, the change completes asynchronously",
            Self::NotFound => "Verify the names used in the configuration",
            Self::Http => "Check the response payload for the rejected fields",
            Self::Transport => "Check the server URL, credentials and TLS settings",
            Self::Format => "Check the server version against the supported API",
            Self::Other => "Check the error details for more information",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur while talking to the remote API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server answered with an error status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Raw response payload.
        body: String,
    },

    /// The request never produced a status (DNS, TLS, connection reset...).
    #[error("transport error: {0}")]
    Transport(String),

    /// A search could not be completed.
    #[error("search on {endpoint} failed: {source}")]
    RemoteQuery {
        /// Endpoint that was searched.
        endpoint: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Response body could not be decoded.
    #[error("invalid API response: {0}")]
    InvalidResponse(String),

    /// A desired entity lacks the field it is matched on.
    #[error("{kind} has no value for key field '{field}'")]
    MissingKey {
        /// Entity kind.
        kind: String,
        /// Name of the key field.
        field: String,
    },

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an HTTP status error.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            body: body.into(),
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Http { status, body } => match status {
                404 => ErrorCategory::NotFound,
                409 | 422 => ErrorCategory::Conflict,
                500 if body.contains(LOCK_MESSAGE) => ErrorCategory::Locked,
                500 if body.contains(SYNC_TIMEOUT_MARKER) => ErrorCategory::SoftTimeout,
                _ => ErrorCategory::Http,
            },
            Error::Transport(_) => ErrorCategory::Transport,
            Error::RemoteQuery { source, .. } => source.category(),
            Error::InvalidResponse(_) => ErrorCategory::Format,
            Error::MissingKey { .. } | Error::Other(_) => ErrorCategory::Other,
        }
    }

    /// HTTP status, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::RemoteQuery { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Identifier of the task holding a resource lock, taken from the payload.
    pub fn lock_owner(&self) -> Option<String> {
        match self {
            Error::Http { body, .. } => LOCK_OWNER
                .captures(body)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
            _ => None,
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Self::Http {
                status: code,
                body: String::new(),
            },
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}
