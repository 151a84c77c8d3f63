//! RLK Client - terminal client for a remote lock session
//!
//! Joins a session by id or share link, mirrors the controller's lock state
//! onto the terminal and reports presence until disconnected.

pub mod cli;
pub mod config;
pub mod terminal;

pub use cli::Cli;
pub use config::{CliOverrides, Config};
pub use terminal::TerminalDevice;

use rlk_core::errors::ErrorClass;
use rlk_core::{SessionError, StoreError};

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: General error
/// - 4: Connection failed
/// - 5: Invalid input
/// - 6: Session not found
/// - 7: Permission denied or rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    ConnectionFailed = 4,
    InvalidInput = 5,
    NotFound = 6,
    PermissionDenied = 7,
}

impl ExitCode {
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    pub fn for_session_error(error: &SessionError) -> Self {
        match error {
            SessionError::InvalidSessionId(_) => ExitCode::InvalidInput,
            other => match other.class() {
                ErrorClass::NotFound => ExitCode::NotFound,
                ErrorClass::WriteFailed => ExitCode::ConnectionFailed,
                ErrorClass::PermissionDenied | ErrorClass::Rejected => ExitCode::PermissionDenied,
            },
        }
    }

    pub fn for_error(error: &anyhow::Error) -> Self {
        if let Some(e) = error.downcast_ref::<SessionError>() {
            Self::for_session_error(e)
        } else if let Some(e) = error.downcast_ref::<StoreError>() {
            Self::for_session_error(&SessionError::from(e.clone()))
        } else if error.downcast_ref::<config::ConfigError>().is_some() {
            ExitCode::InvalidInput
        } else {
            ExitCode::GeneralError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitCode::NotFound as i32, 6);
        assert_eq!(
            ExitCode::for_session_error(&SessionError::NotFound("s1".into())),
            ExitCode::NotFound
        );
        assert_eq!(
            ExitCode::for_session_error(&SessionError::InvalidState("ended".into())),
            ExitCode::PermissionDenied
        );
        assert_eq!(
            ExitCode::for_error(&anyhow::Error::new(StoreError::WriteFailed("disk".into()))),
            ExitCode::ConnectionFailed
        );
    }
}
