//! Error types shared by the controller and client roles.

use thiserror::Error;

use crate::store::StoreError;

/// Coarse error class surfaced to operators and mapped to exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The session (or a node in it) does not exist.
    NotFound,
    /// A store write could not be completed.
    WriteFailed,
    /// The store or the device refused the operation.
    PermissionDenied,
    /// The operation is not valid in the current role state.
    Rejected,
}

/// Errors raised by role operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("no active session")]
    NoActiveSession,

    #[error("no client connected")]
    NoClientConnected,

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("malformed session record: {0}")]
    Malformed(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::NotFound(_) => ErrorClass::NotFound,
            SessionError::WriteFailed(_) | SessionError::Malformed(_) | SessionError::Unavailable(_) => {
                ErrorClass::WriteFailed
            }
            SessionError::PermissionDenied(_) => ErrorClass::PermissionDenied,
            SessionError::NoActiveSession
            | SessionError::NoClientConnected
            | SessionError::InvalidSessionId(_)
            | SessionError::InvalidState(_) => ErrorClass::Rejected,
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(p) => SessionError::NotFound(p),
            StoreError::WriteFailed(m) => SessionError::WriteFailed(m),
            StoreError::PermissionDenied(m) => SessionError::PermissionDenied(m),
            StoreError::InvalidPath(p) => SessionError::InvalidSessionId(p),
            StoreError::Serialization(m) => SessionError::Malformed(m),
            StoreError::Unavailable(m) => SessionError::Unavailable(m),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Malformed(e.to_string())
    }
}

/// Reject ids that would address something other than one session record.
pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    let bad = id.is_empty()
        || id.len() > 256
        || id
            .chars()
            .any(|c| c.is_control() || matches!(c, '/' | '.' | '#' | '$' | '[' | ']'));
    if bad {
        Err(SessionError::InvalidSessionId(id.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        assert_eq!(
            SessionError::from(StoreError::PermissionDenied("rules".into())).class(),
            ErrorClass::PermissionDenied
        );
        assert_eq!(
            SessionError::from(StoreError::WriteFailed("offline".into())).class(),
            ErrorClass::WriteFailed
        );
        assert_eq!(SessionError::NoClientConnected.class(), ErrorClass::Rejected);
    }

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("session_1700000000000_k3j9x2a1b").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("s1/client").is_err());
        assert!(validate_session_id("a.b").is_err());
        assert!(validate_session_id("tab\there").is_err());
    }
}
