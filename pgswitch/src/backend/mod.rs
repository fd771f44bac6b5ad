//! Database backends: connections, retries and routing.

pub mod pool;
pub mod retry;
pub mod server;

pub use pool::{Address, Guard, Pool, Route, Router, Target};
pub use retry::Retry;
pub use server::Server;

use thiserror::Error;
use tokio_postgres::error::SqlState;

use crate::error::ErrorKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Pg(#[from] tokio_postgres::Error),

    #[error("checkout timeout")]
    CheckoutTimeout,

    #[error("pool is offline")]
    Offline,

    #[error("routing is frozen")]
    Frozen,

    #[error("connect attempts exhausted: {0}")]
    ConnectAttempts(#[source] tokio_postgres::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Pg(err) if pg_transient(err) => ErrorKind::Unavailable,
            Error::Pg(_) => ErrorKind::Validation,
            Error::CheckoutTimeout | Error::Offline | Error::Frozen => ErrorKind::Unavailable,
            Error::ConnectAttempts(_) | Error::ConnectionClosed => ErrorKind::Unavailable,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Worth another attempt.
    pub fn transient(&self) -> bool {
        match self {
            Error::Pg(err) => pg_transient(err),
            Error::CheckoutTimeout | Error::Offline | Error::Frozen => true,
            Error::ConnectionClosed => true,
            Error::ConnectAttempts(_) | Error::Cancelled => false,
        }
    }
}

/// Transient conditions: the connection died, the server is shutting
/// down or rejecting new work. Logical errors (syntax, constraints,
/// permissions) propagate.
pub(crate) fn pg_transient(err: &tokio_postgres::Error) -> bool {
    if err.is_closed() {
        return true;
    }

    match err.code() {
        Some(code) => matches!(
            *code,
            SqlState::CONNECTION_EXCEPTION
                | SqlState::CONNECTION_DOES_NOT_EXIST
                | SqlState::CONNECTION_FAILURE
                | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
                | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION
                | SqlState::ADMIN_SHUTDOWN
                | SqlState::CRASH_SHUTDOWN
                | SqlState::CANNOT_CONNECT_NOW
                | SqlState::TOO_MANY_CONNECTIONS
                | SqlState::T_R_SERIALIZATION_FAILURE
                | SqlState::T_R_DEADLOCK_DETECTED
        ),
        // No SQLSTATE means we never got a reply: I/O or timeout.
        None => true,
    }
}
