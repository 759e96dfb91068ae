use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::platform::Family;
use crate::engine::framework::Concern;

/// Typed error kinds for every module and engine boundary.
///
/// Callers match on variants, never on message text. String renderings are
/// for humans only.
#[derive(Debug, Error)]
pub enum HardnError {
    #[error("must be run as root")]
    NotRoot,

    #[error("{concern} is not supported on {family}")]
    UnsupportedPlatform { family: Family, concern: Concern },

    #[error("refusing to disable root SSH login: no non-system user with authorized keys exists or is planned")]
    LockoutRisk,

    #[error("invalid {field}: {reason}")]
    ValidationFailed { field: String, reason: String },

    #[error("{op} failed for {path}: {source}")]
    IoError {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("command {argv:?} exited with status {exit}: {stderr}")]
    CommandFailed {
        argv: Vec<String>,
        exit: i32,
        stderr: String,
    },

    #[error("command {argv:?} timed out after {after_secs}s")]
    Timeout { argv: Vec<String>, after_secs: u64 },

    #[error("another hardening run holds the lock")]
    AlreadyRunning,

    #[error("run cancelled by operator")]
    Cancelled,
}

/// How far an error is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Abort the whole engine run.
    Fatal,
    /// Record in the module result and continue with other modules.
    Recoverable,
}

impl HardnError {
    /// Default severity classification. Call sites may upgrade a
    /// `Recoverable` error (e.g. `visudo -c` failure, `ufw enable`).
    pub fn severity(&self) -> Severity {
        match self {
            HardnError::NotRoot | HardnError::AlreadyRunning => Severity::Fatal,
            // Fatal within the owning module; the engine still continues.
            HardnError::LockoutRisk
            | HardnError::Cancelled
            | HardnError::UnsupportedPlatform { .. }
            | HardnError::ValidationFailed { .. }
            | HardnError::IoError { .. }
            | HardnError::CommandFailed { .. }
            | HardnError::Timeout { .. } => Severity::Recoverable,
        }
    }

    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        use crate::core::config;
        match self {
            HardnError::NotRoot => config::EXIT_NEEDS_ROOT,
            HardnError::AlreadyRunning => config::EXIT_ALREADY_RUNNING,
            HardnError::LockoutRisk => config::EXIT_LOCKOUT,
            HardnError::ValidationFailed { .. } => config::EXIT_USAGE,
            _ => config::EXIT_FAILURE,
        }
    }

    pub fn io(path: impl Into<PathBuf>, op: &'static str, source: io::Error) -> Self {
        HardnError::IoError {
            path: path.into(),
            op,
            source,
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        HardnError::ValidationFailed {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for cleaner code
pub type HardnResult<T> = Result<T, HardnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_errors_are_fatal() {
        assert_eq!(HardnError::NotRoot.severity(), Severity::Fatal);
        assert_eq!(HardnError::AlreadyRunning.severity(), Severity::Fatal);
    }

    #[test]
    fn lockout_is_recoverable_at_engine_level() {
        assert_eq!(HardnError::LockoutRisk.severity(), Severity::Recoverable);
        assert_eq!(HardnError::LockoutRisk.exit_code(), 3);
    }

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(HardnError::NotRoot.exit_code(), 5);
        assert_eq!(HardnError::AlreadyRunning.exit_code(), 4);
        assert_eq!(
            HardnError::validation("dns.nameservers", "not an IP literal").exit_code(),
            2
        );
        assert_eq!(
            HardnError::CommandFailed {
                argv: vec!["ufw".into(), "enable".into()],
                exit: 1,
                stderr: String::new(),
            }
            .exit_code(),
            1
        );
    }
}
