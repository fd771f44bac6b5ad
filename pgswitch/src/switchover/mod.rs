//! Cluster-coordinated switchover.
//!
//! Every replica runs a handler that listens on the coordination bus,
//! tracks the cluster-wide phase, and flips its routing connector when
//! the leader says so.

pub mod bus;
pub mod handler;
pub mod message;
pub mod node;
pub mod session;
pub mod state;

pub use bus::Bus;
pub use handler::Handler;
pub use message::{Envelope, MessageKind};
pub use node::{NodeInfo, Nodes};
pub use session::Session;
pub use state::PhaseStore;

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::error::ErrorKind;

/// Cluster-wide switchover stage. At most one phase is active at any
/// time; transitions are totally ordered by the version counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    SyncPending,
    Syncing,
    Ready,
    Executing,
    Complete,
    Aborted,
}

impl Phase {
    /// Terminal phases accept no transitions other than reset.
    pub fn terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Aborted)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Phase::*;
        match self {
            Idle => write!(f, "idle"),
            SyncPending => write!(f, "sync_pending"),
            Syncing => write!(f, "syncing"),
            Ready => write!(f, "ready"),
            Executing => write!(f, "executing"),
            Complete => write!(f, "complete"),
            Aborted => write!(f, "aborted"),
        }
    }
}

impl FromStr for Phase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Phase::*;
        match s {
            "idle" => Ok(Idle),
            "sync_pending" => Ok(SyncPending),
            "syncing" => Ok(Syncing),
            "ready" => Ok(Ready),
            "executing" => Ok(Executing),
            "complete" => Ok(Complete),
            "aborted" => Ok(Aborted),
            _ => Err(()),
        }
    }
}

/// This replica's own view of the switchover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocalStatus {
    #[default]
    Unknown,
    Ready,
    Armed,
    Flipped,
    Error,
}

impl std::fmt::Display for LocalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use LocalStatus::*;
        match self {
            Unknown => write!(f, "unknown"),
            Ready => write!(f, "ready"),
            Armed => write!(f, "armed"),
            Flipped => write!(f, "flipped"),
            Error => write!(f, "error"),
        }
    }
}

impl FromStr for LocalStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use LocalStatus::*;
        match s {
            "unknown" => Ok(Unknown),
            "ready" => Ok(Ready),
            "armed" => Ok(Armed),
            "flipped" => Ok(Flipped),
            "error" => Ok(Error),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Backend(#[from] crate::backend::Error),

    #[error("{0}")]
    Sync(#[from] crate::sync::Error),

    #[error("bad bus message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("phase moved underneath us, expected {expected}")]
    PhaseConflict { expected: Phase },

    #[error("no freeze ack from {missing} node(s) within budget")]
    AckTimeout { missing: usize },

    #[error("switchover aborted: {0}")]
    Aborted(String),

    #[error("not the leader")]
    NotLeader,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Backend(err) => err.kind(),
            Error::Sync(err) => err.kind(),
            Error::Json(_) => ErrorKind::Validation,
            Error::PhaseConflict { .. } => ErrorKind::Aborted,
            Error::AckTimeout { .. } | Error::Aborted(_) => ErrorKind::Aborted,
            Error::NotLeader => ErrorKind::Validation,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_phase_round_trip() {
        use Phase::*;
        for phase in [Idle, SyncPending, Syncing, Ready, Executing, Complete, Aborted] {
            assert_eq!(phase.to_string().parse::<Phase>().unwrap(), phase);
        }
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Phase::Complete.terminal());
        assert!(Phase::Aborted.terminal());
        assert!(!Phase::Executing.terminal());
        assert!(!Phase::Idle.terminal());
    }

    #[test]
    fn test_local_status_round_trip() {
        use LocalStatus::*;
        for status in [Unknown, Ready, Armed, Flipped, Error] {
            assert_eq!(status.to_string().parse::<LocalStatus>().unwrap(), status);
        }
    }
}
