//! Error types for the host agent

use std::time::Duration;
use thiserror::Error;

/// Remote error code for an expired or unknown session.
pub const SESSION_INVALID: &str = "SESSION_INVALID";
/// Remote error code for a reference that no longer resolves.
pub const HANDLE_INVALID: &str = "HANDLE_INVALID";
/// Remote error code for rejected credentials.
pub const SESSION_AUTHENTICATION_FAILED: &str = "SESSION_AUTHENTICATION_FAILED";
/// Remote error code for a UUID that names no object.
pub const UUID_INVALID: &str = "UUID_INVALID";
/// Remote error code for a backing store already claimed by another SR.
pub const SR_DEVICE_IN_USE: &str = "SR_DEVICE_IN_USE";

#[derive(Error, Debug)]
pub enum Error {
    #[error("{call} failed: {code} {params:?}")]
    Api {
        call: String,
        code: String,
        params: Vec<String>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication rejected by {host} - fix the configured credentials")]
    AuthenticationFailed { host: String },

    #[error("{operation} timed out after {elapsed:?} (task {task})")]
    Timeout {
        operation: String,
        task: String,
        elapsed: Duration,
    },

    #[error("{operation} failed (task {task}): {error_info:?}")]
    TaskFailed {
        operation: String,
        task: String,
        error_info: Vec<String>,
    },

    #[error("{operation} was cancelled (task {task})")]
    TaskCancelled { operation: String, task: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid state: {object} is {current}, expected {expected}")]
    InvalidState {
        object: String,
        current: String,
        expected: String,
    },

    #[error("{operation} failed and was rolled back: {source}")]
    Compensated {
        operation: String,
        #[source]
        source: Box<Error>,
        cleanup_failures: Vec<String>,
    },

    #[error("SR {sr} still has {} PBD(s) after {passes} teardown pass(es): {last_error}", pbd_count(.remaining))]
    TeardownIncomplete {
        sr: String,
        /// `None` when the SR could not be read back after the last pass.
        remaining: Option<usize>,
        passes: u32,
        last_error: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Statistics error: {0}")]
    Stats(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn pbd_count(remaining: &Option<usize>) -> String {
    remaining.map_or_else(|| "an unknown number of".to_string(), |n| n.to_string())
}

/// Coarse classification used for retry decisions and answer text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport or session failure; retried by re-authenticating.
    Session,
    /// A task exceeded its wall-clock budget.
    Timeout,
    /// A named resource exists in an incompatible configuration.
    Conflict,
    /// Rejected before any remote mutation.
    Precondition,
    /// A multi-step sequence failed part way through.
    PartialFailure,
    /// Any other failure reported by the remote side.
    Remote,
    /// Local failure (config, IO, parsing).
    Local,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Session => "session",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Precondition => "precondition",
            ErrorKind::PartialFailure => "partial-failure",
            ErrorKind::Remote => "remote",
            ErrorKind::Local => "local",
        };
        write!(f, "{}", s)
    }
}

impl Error {
    /// Build a remote API error.
    pub fn api(call: impl Into<String>, code: impl Into<String>, params: Vec<String>) -> Self {
        Error::Api {
            call: call.into(),
            code: code.into(),
            params,
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Remote error code, if this came from the management API.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_session_invalid(&self) -> bool {
        self.code() == Some(SESSION_INVALID)
    }

    pub fn is_handle_invalid(&self) -> bool {
        self.code() == Some(HANDLE_INVALID)
    }

    /// The named remote object does not exist.
    pub fn is_missing_object(&self) -> bool {
        matches!(self.code(), Some(UUID_INVALID) | Some(HANDLE_INVALID))
            || matches!(self, Error::NotFound { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Api { code, .. } if code == SESSION_INVALID => ErrorKind::Session,
            Error::Api { code, .. } if code == SR_DEVICE_IN_USE => ErrorKind::Conflict,
            Error::Api { .. } | Error::TaskFailed { .. } | Error::TaskCancelled { .. } => {
                ErrorKind::Remote
            }
            Error::Transport(_) | Error::AuthenticationFailed { .. } | Error::Http(_) => {
                ErrorKind::Session
            }
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Precondition(_) => ErrorKind::Precondition,
            Error::Compensated { .. } | Error::TeardownIncomplete { .. } => {
                ErrorKind::PartialFailure
            }
            Error::NotFound { .. } | Error::InvalidState { .. } => ErrorKind::Remote,
            Error::Config(_) | Error::Stats(_) | Error::Io(_) | Error::Json(_) => ErrorKind::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_invalid_detection() {
        let err = Error::api("VM.get_record", SESSION_INVALID, vec!["OpaqueRef:1".into()]);
        assert!(err.is_session_invalid());
        assert!(!err.is_handle_invalid());
        assert_eq!(err.kind(), ErrorKind::Session);
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::Conflict("sr".into()).kind(), ErrorKind::Conflict);
        assert_eq!(Error::Precondition("mem".into()).kind(), ErrorKind::Precondition);
        assert_eq!(
            Error::api("SR.create", SR_DEVICE_IN_USE, vec![]).kind(),
            ErrorKind::Conflict
        );
        let compensated = Error::Compensated {
            operation: "start".into(),
            source: Box::new(Error::Transport("reset".into())),
            cleanup_failures: vec![],
        };
        assert_eq!(compensated.kind(), ErrorKind::PartialFailure);
    }

    #[test]
    fn test_compensated_keeps_original_message() {
        let err = Error::Compensated {
            operation: "StartVm i-2-3-test".into(),
            source: Box::new(Error::api("VIF.create", "NETWORK_DOWN", vec![])),
            cleanup_failures: vec![],
        };
        let text = err.to_string();
        assert!(text.contains("VIF.create"));
        assert!(text.contains("NETWORK_DOWN"));
    }
}
