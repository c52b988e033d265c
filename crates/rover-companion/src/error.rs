//! Companion error taxonomy and process exit codes.
//!
//! Per-message errors are recovered locally (log and drop), per-link
//! errors by reconnecting, per-process errors end up here and map to an
//! exit code.

use thiserror::Error;

/// Exit code for a clean shutdown.
pub const EXIT_OK: u8 = 0;
/// Exit code for a configuration parse error.
pub const EXIT_CONFIG: u8 = 2;
/// Exit code for a configuration validation failure.
pub const EXIT_VALIDATION: u8 = 3;
/// Exit code for an unrecoverable link error.
pub const EXIT_LINK: u8 = 4;
/// Exit code for a watchdog unsafe signal.
pub const EXIT_UNSAFE: u8 = 5;

/// Fatal companion-level failures.
#[derive(Debug, Error)]
pub enum CompanionError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration invalid: {0}")]
    Validation(String),

    #[error("unrecoverable link error: {0}")]
    Link(String),

    #[error("watchdog unsafe signal: {0}")]
    Unsafe(String),
}

impl CompanionError {
    /// The process exit code this failure maps to.
    pub fn exit_code(&self) -> u8 {
        match self {
            CompanionError::Config(_) => EXIT_CONFIG,
            CompanionError::Validation(_) => EXIT_VALIDATION,
            CompanionError::Link(_) => EXIT_LINK,
            CompanionError::Unsafe(_) => EXIT_UNSAFE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CompanionError::Config("x".into()).exit_code(), 2);
        assert_eq!(CompanionError::Validation("x".into()).exit_code(), 3);
        assert_eq!(CompanionError::Link("x".into()).exit_code(), 4);
        assert_eq!(CompanionError::Unsafe("x".into()).exit_code(), 5);
    }
}
