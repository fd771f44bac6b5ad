//! Error classification shared across the crate.
//!
//! Every module keeps its own error enum; this is the common
//! classification used for retry policy and process exit codes.

/// Semantic class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, surfaced to the caller verbatim.
    Validation,
    /// Transient backend condition, safe to retry.
    Unavailable,
    /// Switchover invariant violated, cluster rolled back.
    Aborted,
    /// Corruption signal, process halts after safe rollback.
    Fatal,
    /// Context-driven cancellation, not an error per se.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;
        match self {
            Validation => write!(f, "validation"),
            Unavailable => write!(f, "unavailable"),
            Aborted => write!(f, "aborted"),
            Fatal => write!(f, "fatal"),
            Cancelled => write!(f, "cancelled"),
        }
    }
}

impl ErrorKind {
    /// Process exit code for errors that bubble up to main.
    pub fn exit_code(&self) -> i32 {
        use ErrorKind::*;
        match self {
            Validation => 1,
            Aborted => 4,
            _ => 1,
        }
    }
}
