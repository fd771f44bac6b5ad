//! Engine cycles.
//!
//! Cursor-driven batch workers. Each cycle loads its state blob under
//! an advisory lock, does a bounded amount of work, advances its
//! cursor and commits; any failure rolls back and leaves the cursor
//! where it was, so a cycle is always safe to retry.

pub mod lock_state;
pub mod metrics;

pub use lock_state::{StateStore, StateTx};
pub use metrics::MetricsCycle;

use thiserror::Error as ThisError;

use crate::error::ErrorKind;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("{0}")]
    Backend(#[from] crate::backend::Error),

    #[error("{0}")]
    Pg(#[from] tokio_postgres::Error),

    #[error("state blob: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Backend(err) => err.kind(),
            Error::Pg(err) if crate::backend::pg_transient(err) => ErrorKind::Unavailable,
            Error::Pg(_) => ErrorKind::Validation,
            Error::Json(_) => ErrorKind::Fatal,
        }
    }
}
