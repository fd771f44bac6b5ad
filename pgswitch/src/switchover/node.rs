//! Node membership.
//!
//! Every replica keeps a heartbeat row in `switchover_nodes` on the
//! old database. A node is live if its heartbeat is within twice the
//! heartbeat interval; the leader is the live node with the lowest id.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{Error, LocalStatus, Session};

#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub node_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub local_status: LocalStatus,
}

#[derive(Clone)]
pub struct Nodes {
    session: Arc<Session>,
    node_id: String,
    heartbeat_interval: Duration,
}

impl Nodes {
    pub fn new(session: Arc<Session>, node_id: &str, heartbeat_interval: Duration) -> Self {
        Self {
            session,
            node_id: node_id.to_string(),
            heartbeat_interval,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Insert or refresh this node's membership row.
    pub async fn beat(&self, status: LocalStatus) -> Result<(), Error> {
        self.session
            .execute(
                "INSERT INTO switchover_nodes (node_id, last_heartbeat, local_status) \
                 VALUES ($1, now(), $2) \
                 ON CONFLICT (node_id) DO UPDATE \
                 SET last_heartbeat = now(), local_status = EXCLUDED.local_status",
                &[&self.node_id, &status.to_string()],
            )
            .await?;

        Ok(())
    }

    pub async fn deregister(&self) -> Result<(), Error> {
        self.session
            .execute(
                "DELETE FROM switchover_nodes WHERE node_id = $1",
                &[&self.node_id],
            )
            .await?;

        Ok(())
    }

    /// All nodes with a recent enough heartbeat, ordered by id.
    pub async fn live(&self) -> Result<Vec<NodeInfo>, Error> {
        let cutoff = self.liveness_cutoff_secs();
        let rows = self
            .session
            .query(
                "SELECT node_id, last_heartbeat, local_status FROM switchover_nodes \
                 WHERE last_heartbeat > now() - make_interval(secs => $1) \
                 ORDER BY node_id",
                &[&cutoff],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| NodeInfo {
                node_id: row.get(0),
                last_heartbeat: row.get(1),
                local_status: row
                    .get::<_, String>(2)
                    .parse()
                    .unwrap_or(LocalStatus::Unknown),
            })
            .collect())
    }

    /// Leader is elected by lowest live node id. Re-election is
    /// implicit: it runs on every heartbeat tick.
    pub async fn leader(&self) -> Result<Option<String>, Error> {
        Ok(self.live().await?.into_iter().map(|n| n.node_id).next())
    }

    pub async fn is_leader(&self) -> Result<bool, Error> {
        Ok(self.leader().await?.as_deref() == Some(self.node_id.as_str()))
    }

    /// Remove rows of nodes that stopped heartbeating. Leader duty.
    pub async fn prune(&self) -> Result<u64, Error> {
        let cutoff = self.liveness_cutoff_secs();
        Ok(self
            .session
            .execute(
                "DELETE FROM switchover_nodes \
                 WHERE last_heartbeat <= now() - make_interval(secs => $1)",
                &[&cutoff],
            )
            .await?)
    }

    fn liveness_cutoff_secs(&self) -> f64 {
        self.heartbeat_interval.as_secs_f64() * 2.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{Address, Target};

    #[test]
    fn test_liveness_cutoff() {
        let session = Arc::new(Session::new(
            Address::new(Target::Old, "postgres://pgswitch@127.0.0.1:5432/old").unwrap(),
        ));
        let nodes = Nodes::new(session, "aabbccdd", Duration::from_secs(1));
        assert_eq!(nodes.liveness_cutoff_secs(), 2.0);
    }
}
