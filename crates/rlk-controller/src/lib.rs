//! RLK Controller - CLI for the controlling side of a remote lock session
//!
//! This crate provides a command-line interface for:
//! - Creating and loading sessions
//! - Sending lock, unlock and other commands
//! - Printing share links and QR codes
//! - Watching client presence

pub mod cli;
pub mod config;
pub mod output;

pub use cli::Cli;
pub use config::{CliOverrides, Config};
pub use output::{JsonResponse, OutputFormat, OutputFormatter, SuccessMessage};

use rlk_core::errors::ErrorClass;
use rlk_core::{SessionError, StoreError};

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: General error
/// - 4: Connection failed - the session store could not be reached or written
/// - 5: Invalid input - bad arguments or session id
/// - 6: Not found - the session does not exist
/// - 7: Permission denied or rejected by the current session state
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

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::NotFound => "NOT_FOUND",
            ExitCode::PermissionDenied => "PERMISSION_DENIED",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExitCode::Success => "Operation completed successfully",
            ExitCode::GeneralError => "An unspecified error occurred",
            ExitCode::ConnectionFailed => "Could not reach or write the session store",
            ExitCode::InvalidInput => "Invalid arguments or session id",
            ExitCode::NotFound => "Session not found",
            ExitCode::PermissionDenied => "Operation refused",
        }
    }

    /// Map a role error to the exit code scripts see.
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

    /// Exit code for an error that escaped a command.
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
mod exit_code_tests {
    use super::*;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success as i32, 0);
        assert_eq!(ExitCode::GeneralError as i32, 1);
        assert_eq!(ExitCode::ConnectionFailed as i32, 4);
        assert_eq!(ExitCode::InvalidInput as i32, 5);
        assert_eq!(ExitCode::NotFound as i32, 6);
        assert_eq!(ExitCode::PermissionDenied as i32, 7);
    }

    #[test]
    fn test_exit_code_names() {
        assert_eq!(ExitCode::Success.name(), "SUCCESS");
        assert_eq!(ExitCode::NotFound.name(), "NOT_FOUND");
        assert!(!ExitCode::PermissionDenied.description().is_empty());
    }

    #[test]
    fn test_session_error_mapping() {
        assert_eq!(
            ExitCode::for_session_error(&SessionError::NotFound("s".into())),
            ExitCode::NotFound
        );
        assert_eq!(
            ExitCode::for_session_error(&SessionError::WriteFailed("offline".into())),
            ExitCode::ConnectionFailed
        );
        assert_eq!(
            ExitCode::for_session_error(&SessionError::NoClientConnected),
            ExitCode::PermissionDenied
        );
        assert_eq!(
            ExitCode::for_session_error(&SessionError::InvalidSessionId("a/b".into())),
            ExitCode::InvalidInput
        );
    }

    #[test]
    fn test_escaped_error_mapping() {
        let store = anyhow::Error::new(StoreError::Unavailable("locked".into()));
        assert_eq!(ExitCode::for_error(&store), ExitCode::ConnectionFailed);
        let other = anyhow::anyhow!("boom");
        assert_eq!(ExitCode::for_error(&other), ExitCode::GeneralError);
    }
}
