//! Typed failure modes the keeper loop must distinguish (spec.md §7).
//!
//! Everything else (file I/O details, SQL driver plumbing) is carried as
//! `anyhow::Error` context at the call site; these variants exist only for
//! the cases the loop branches on.

use thiserror::Error;

/// SQLSTATE classes the monitor client treats as transiently retryable
/// (spec.md §4.4: "Retryable SQLSTATEs ... classes 53 and 54").
pub const STR_ERRCODE_OBJECT_IN_USE: &str = "55006";
pub const STR_ERRCODE_EXCLUSION_VIOLATION: &str = "23P01";

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("unknown role name from monitor: {0:?}")]
    UnknownRole(String),

    #[error(
        "PostgreSQL is expected to run on port {expected}, found to be running on port {found}"
    )]
    PortMismatch { expected: u16, found: u16 },

    #[error(
        "system_identifier drift: keeper state has {expected}, Postgres reports {found}"
    )]
    IdentityDrift { expected: u64, found: u64 },

    #[error("monitor extension version mismatch: expected {expected}, installed {installed}")]
    MonitorIncompatible { expected: String, installed: String },

    #[error("registration conflict (system_identifier {system_identifier}): {message}")]
    RegistrationConflict {
        system_identifier: u64,
        message: String,
    },

    #[error("configuration change rejected: {0}")]
    ConfigRejected(String),

    #[error("transient monitor error (sqlstate {sqlstate}): {message}")]
    TransientRemote { sqlstate: String, message: String },

    #[error("state file has unknown schema version {found}, expected {expected}")]
    StateSchemaMismatch { expected: u32, found: u32 },

    #[error("too many peers: {count} exceeds NODE_ARRAY_MAX_COUNT ({max})")]
    TooManyPeers { count: usize, max: usize },
}

impl KeeperError {
    /// Retryable per spec.md §4.4: "classes 53 and 54" (resource-not-available
    /// / operator-intervention) together with the transaction-layer failures
    /// that are always safe to retry from scratch: serialization failures
    /// (40001), deadlock detected (40P01), statement-completion-unknown
    /// (40003), and the monitor's own registration-in-progress signal
    /// (55006, `STR_ERRCODE_OBJECT_IN_USE`).
    pub fn is_retryable_sqlstate(sqlstate: &str) -> bool {
        sqlstate.starts_with("53")
            || sqlstate.starts_with("54")
            || sqlstate == "40001"
            || sqlstate == "40P01"
            || sqlstate == "40003"
            || sqlstate == STR_ERRCODE_OBJECT_IN_USE
    }
}

/// Stable process exit codes (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Ok = 0,
    BadConfig = 1,
    InternalError = 2,
    Pgctl = 3,
    Monitor = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_53_and_54_are_retryable() {
        assert!(KeeperError::is_retryable_sqlstate("53200"));
        assert!(KeeperError::is_retryable_sqlstate("54000"));
    }

    #[test]
    fn serialization_deadlock_and_completion_unknown_are_retryable() {
        assert!(KeeperError::is_retryable_sqlstate("40001"));
        assert!(KeeperError::is_retryable_sqlstate("40P01"));
        assert!(KeeperError::is_retryable_sqlstate("40003"));
    }

    #[test]
    fn object_in_use_is_retryable() {
        assert!(KeeperError::is_retryable_sqlstate(STR_ERRCODE_OBJECT_IN_USE));
    }

    #[test]
    fn exclusion_violation_is_not_retryable() {
        assert!(!KeeperError::is_retryable_sqlstate(
            STR_ERRCODE_EXCLUSION_VIOLATION
        ));
    }

    #[test]
    fn syntax_error_is_not_retryable() {
        assert!(!KeeperError::is_retryable_sqlstate("42601"));
    }
}
