//! Error taxonomy for calls that leave the process (AI model, storage, ...).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an external-call failure.
///
/// Retry policies decide per kind whether a failure is worth another attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The call did not finish within its time budget.
    Timeout,
    /// Connection refused/reset, DNS failure, broken pipe.
    Connection,
    /// The remote side asked us to slow down.
    RateLimited,
    /// The remote service is temporarily unavailable (5xx).
    Unavailable,
    /// The request itself is malformed; retrying cannot help.
    InvalidInput,
    /// A referenced resource does not exist.
    NotFound,
    /// The response (or the input artifact) could not be decoded.
    Decode,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Timeout,
        ErrorKind::Connection,
        ErrorKind::RateLimited,
        ErrorKind::Unavailable,
        ErrorKind::InvalidInput,
        ErrorKind::NotFound,
        ErrorKind::Decode,
        ErrorKind::Internal,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Decode => "decode",
            ErrorKind::Internal => "internal",
        }
    }

    /// Kinds that usually clear up on their own; the default retry allowlist.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Connection
                | ErrorKind::RateLimited
                | ErrorKind::Unavailable
        )
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single external call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CallError {
    kind: ErrorKind,
    message: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, msg)
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, msg)
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Decode, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// An identifier string could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {type_name}: {reason}")]
pub struct InvalidId {
    type_name: &'static str,
    reason: String,
}

impl InvalidId {
    pub fn new(type_name: &'static str, reason: impl core::fmt::Display) -> Self {
        Self {
            type_name,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_display_carries_kind() {
        let err = CallError::decode("png header missing");
        assert_eq!(err.to_string(), "decode: png header missing");
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn transient_kinds() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::RateLimited.is_transient());
        assert!(!ErrorKind::Decode.is_transient());
        assert!(!ErrorKind::InvalidInput.is_transient());
    }
}
