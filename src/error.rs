//! Error taxonomy: fetch, plan and write failures, plus the run-level error record
//! surfaced in `RunSummary`.

use crate::window::Window;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Why a transient fetch failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    Network,
    RateLimited,
    Server,
    Timeout,
}

/// Failure of a single API call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchError {
    /// Network failure, rate-limit signal or 5xx. Retried with backoff.
    Transient {
        kind: TransientKind,
        status: Option<u16>,
        retry_after: Option<Duration>,
        message: String,
    },
    /// Auth failure, not-found and other client errors. Aborts the window.
    Fatal { status: Option<u16>, message: String },
}

impl FetchError {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16, retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match status {
            429 => TransientKind::RateLimited,
            408 => TransientKind::Timeout,
            500..=599 => TransientKind::Server,
            _ => return FetchError::Fatal { status: Some(status), message },
        };
        FetchError::Transient { kind, status: Some(status), retry_after, message }
    }

    pub fn network(message: impl Into<String>) -> Self {
        FetchError::Transient {
            kind: TransientKind::Network,
            status: None,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn rate_limited(wait: Duration, message: impl Into<String>) -> Self {
        FetchError::Transient {
            kind: TransientKind::RateLimited,
            status: None,
            retry_after: Some(wait),
            message: message.into(),
        }
    }

    pub fn fatal(status: Option<u16>, message: impl Into<String>) -> Self {
        FetchError::Fatal { status, message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Transient { status, .. } | FetchError::Fatal { status, .. } => *status,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() { ErrorKind::TransientFetchError } else { ErrorKind::FatalFetchError }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transient { kind, status, message, .. } => {
                write!(f, "transient fetch error ({kind:?}")?;
                if let Some(s) = status { write!(f, ", status {s}")?; }
                write!(f, "): {message}")
            }
            FetchError::Fatal { status: Some(s), message } => write!(f, "fatal fetch error (status {s}): {message}"),
            FetchError::Fatal { status: None, message } => write!(f, "fatal fetch error: {message}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Failure of one transactional batch write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteError {
    /// Constraint violation (conflicting row) rather than an I/O or engine failure.
    pub conflict: bool,
    pub message: String,
}

impl WriteError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self { conflict: false, message: message.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self { conflict: true, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.conflict { ErrorKind::WriteConflict } else { ErrorKind::WriteFailure }
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.conflict { "write conflict" } else { "write failure" };
        write!(f, "{label}: {}", self.message)
    }
}

impl std::error::Error for WriteError {}

impl From<rusqlite::Error> for WriteError {
    fn from(e: rusqlite::Error) -> Self {
        let conflict = matches!(
            e.sqlite_error_code(),
            Some(rusqlite::ErrorCode::ConstraintViolation)
        );
        Self { conflict, message: e.to_string() }
    }
}

/// Rejected plan request (invalid range or planner settings).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanError(pub String);

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "planner misconfiguration: {}", self.0)
    }
}

impl std::error::Error for PlanError {}

/// What the retry helper needs to know about an error.
pub trait Retryable {
    fn is_transient(&self) -> bool;
    /// Server-provided minimum wait before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        FetchError::is_transient(self)
    }
    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::Transient { retry_after, .. } => *retry_after,
            FetchError::Fatal { .. } => None,
        }
    }
}

// Upserts are idempotent, so every batch failure is worth another attempt.
impl Retryable for WriteError {
    fn is_transient(&self) -> bool {
        true
    }
}

/// Error categories reported in a run summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    TransientFetchError,
    FatalFetchError,
    UnresolvedParent,
    WriteConflict,
    WriteFailure,
    PlannerMisconfiguration,
    Cancelled,
}

/// One entry in `RunSummary::errors`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub record_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<Window>,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), record_ids: Vec::new(), window: None }
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.record_ids = ids;
        self
    }

    pub fn with_window(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }
}
