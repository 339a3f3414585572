//! Error taxonomy for the reconciliation engine.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A failure reported by the remote control plane.
///
/// `code` is the machine-readable error code the API returned (for example
/// `DependencyViolation` or `NoSuchEntity`); retry predicates match on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Errors produced by the engine and by the collaborators it drives.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote object is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Identifier string does not have the expected structure.
    #[error("malformed identifier {id:?}: expected {expected} parts separated by {separator:?}, found {found}")]
    MalformedId {
        id: String,
        expected: usize,
        found: usize,
        separator: char,
    },

    /// A component cannot be encoded into an identifier.
    #[error("invalid identifier component at position {index}: {reason}")]
    InvalidComponent { index: usize, reason: String },

    /// Remote call failed.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Deadline elapsed before a terminal state was reached.
    #[error("timed out after {timeout:?} (last state: {})", describe_state(.last_state))]
    Timeout {
        timeout: Duration,
        last_state: Option<String>,
        #[source]
        last_error: Option<Box<Error>>,
    },

    /// Caller cancelled the operation while it was waiting.
    #[error("operation cancelled")]
    Cancelled {
        #[source]
        last_error: Option<Box<Error>>,
    },

    /// The remote side reports the operation itself failed.
    #[error("remote reported failure state {state:?}{}", describe_reason(.reason))]
    RemoteFailed {
        state: String,
        reason: Option<String>,
    },

    /// Observed a state that is neither pending, target nor failure.
    #[error("unexpected state {state:?}, wanted target [{}]", .expected.join(", "))]
    UnexpectedState { state: String, expected: Vec<String> },

    /// Post-apply verification found the live set differs from the declared set.
    #[error("drift detected on {parent}: missing [{}], unexpected [{}]", .missing.join(", "), .unexpected.join(", "))]
    DriftDetected {
        parent: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    /// Object is still present after waiting for it to disappear.
    #[error("resource still exists")]
    StillExists,

    /// Lookup expected one result and got several.
    #[error("expected a single result, found {count}")]
    TooManyResults { count: usize },

    /// Waiter configuration violates its invariants.
    #[error("invalid wait spec: {0}")]
    InvalidWaitSpec(String),
}

fn describe_state(state: &Option<String>) -> String {
    match state {
        Some(s) if s.is_empty() => "absent".to_string(),
        Some(s) => format!("{s:?}"),
        None => "none".to_string(),
    }
}

fn describe_reason(reason: &Option<String>) -> String {
    match reason {
        Some(r) => format!(": {r}"),
        None => String::new(),
    }
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Api(ApiError::new(code, message))
    }

    pub fn timeout(timeout: Duration, last_state: Option<String>, last_error: Option<Error>) -> Self {
        Error::Timeout {
            timeout,
            last_state,
            last_error: last_error.map(Box::new),
        }
    }

    pub fn cancelled(last_error: Option<Error>) -> Self {
        Error::Cancelled {
            last_error: last_error.map(Box::new),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Remote error code, if this is an API error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Api(e) => Some(e.code.as_str()),
            _ => None,
        }
    }

    /// Identifier errors are permanent and must never be retried.
    pub fn is_identifier_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedId { .. } | Error::InvalidComponent { .. }
        )
    }

    /// Error observed last before a timeout or cancellation.
    pub fn last_error(&self) -> Option<&Error> {
        match self {
            Error::Timeout { last_error, .. } | Error::Cancelled { last_error } => {
                last_error.as_deref()
            }
            _ => None,
        }
    }
}

/// An error together with the last state reached before it happened.
///
/// Waits return the last observation, reconciliations the partial set
/// actually achieved.
#[derive(Debug)]
pub struct Interrupted<T> {
    pub last: T,
    pub error: Error,
}

impl<T> Interrupted<T> {
    pub fn new(last: T, error: Error) -> Self {
        Self { last, error }
    }

    pub fn into_error(self) -> Error {
        self.error
    }
}

impl<T> fmt::Display for Interrupted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl<T: fmt::Debug> std::error::Error for Interrupted<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.error)
    }
}

impl<T> From<Interrupted<T>> for Error {
    fn from(e: Interrupted<T>) -> Self {
        e.error
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
