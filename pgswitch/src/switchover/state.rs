//! Cluster phase state.
//!
//! The `switchover_state` row on the old database is the single source
//! of truth. The version counter increments on every transition, and
//! transitions happen through compare-and-swap only, so two leaders
//! can't both win.

use std::sync::Arc;

use super::{Error, Phase, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterState {
    pub phase: Phase,
    pub version: i64,
}

#[derive(Clone)]
pub struct PhaseStore {
    session: Arc<Session>,
}

impl PhaseStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Current phase and version.
    pub async fn get(&self) -> Result<ClusterState, Error> {
        let row = self
            .session
            .query_opt(
                "SELECT phase, version FROM switchover_state WHERE singleton",
                &[],
            )
            .await?
            .ok_or(Error::PhaseConflict {
                expected: Phase::Idle,
            })?;

        let phase: String = row.get(0);
        let version: i64 = row.get(1);

        Ok(ClusterState {
            phase: phase.parse().unwrap_or(Phase::Idle),
            version,
        })
    }

    /// Compare-and-swap the phase. Fails if another node transitioned
    /// first. Returns the new version.
    pub async fn cas(&self, from: Phase, to: Phase) -> Result<i64, Error> {
        let row = self
            .session
            .query_opt(
                "UPDATE switchover_state \
                 SET phase = $2, version = version + 1, updated_at = now() \
                 WHERE singleton AND phase = $1 \
                 RETURNING version",
                &[&from.to_string(), &to.to_string()],
            )
            .await?;

        match row {
            Some(row) => Ok(row.get(0)),
            None => Err(Error::PhaseConflict { expected: from }),
        }
    }

    /// Force the phase regardless of the current one. Used for abort,
    /// which must win from any non-terminal phase.
    pub async fn force(&self, to: Phase) -> Result<i64, Error> {
        let row = self
            .session
            .query_opt(
                "UPDATE switchover_state \
                 SET phase = $1, version = version + 1, updated_at = now() \
                 WHERE singleton AND phase NOT IN ('complete', 'aborted') \
                 RETURNING version",
                &[&to.to_string()],
            )
            .await?;

        match row {
            Some(row) => Ok(row.get(0)),
            None => Err(Error::PhaseConflict {
                expected: Phase::Idle,
            }),
        }
    }

    /// Reset a terminal phase back to idle.
    pub async fn reset(&self) -> Result<i64, Error> {
        let row = self
            .session
            .query_opt(
                "UPDATE switchover_state \
                 SET phase = 'idle', version = version + 1, updated_at = now() \
                 WHERE singleton AND phase IN ('complete', 'aborted', 'idle') \
                 RETURNING version",
                &[],
            )
            .await?;

        match row {
            Some(row) => Ok(row.get(0)),
            None => Err(Error::PhaseConflict {
                expected: Phase::Aborted,
            }),
        }
    }
}
