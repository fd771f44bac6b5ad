//! Interactive switchover shell.
//!
//! Operator front-end over the coordination bus. Every command is a
//! bus message to the current leader; the shell itself holds no
//! authority and can disconnect at any time without affecting the
//! cluster. Fleet state re-renders once a second while it changes.

pub mod command;

use std::io::Write as _;

use thiserror::Error as ThisError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

use crate::backend::{Address, Target};
use crate::config::config;
use crate::error::ErrorKind;
use crate::switchover::{Bus, Envelope, LocalStatus, Phase, Session};
use crate::util::number_human;

use command::{Command, HELP};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("{0}")]
    Backend(#[from] crate::backend::Error),

    #[error("{0}")]
    Switchover(#[from] crate::switchover::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("db-url-next is not configured, nothing to switch to")]
    SwitchoverDisabled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Backend(err) => err.kind(),
            Error::Switchover(err) => err.kind(),
            Error::Io(_) => ErrorKind::Unavailable,
            Error::SwitchoverDisabled => ErrorKind::Validation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRow {
    pub node_id: String,
    pub local_status: LocalStatus,
    pub heartbeat_age: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetStatus {
    pub phase: Phase,
    pub version: i64,
    pub lag: Option<i64>,
    pub nodes: Vec<NodeRow>,
}

impl FleetStatus {
    /// One line, suitable for the ticking render.
    pub fn summary(&self) -> String {
        let lag = match self.lag {
            Some(lag) => format!("{} rows", number_human(lag.max(0) as u64)),
            None => "n/a".into(),
        };

        format!(
            "phase={} v{} nodes={} lag={}",
            self.phase,
            self.version,
            self.nodes.len(),
            lag,
        )
    }

    /// Full table for the `status` command.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("cluster phase: {} (v{})\n", self.phase, self.version));
        match self.lag {
            Some(lag) => out.push_str(&format!(
                "replication lag: {} row(s)\n",
                number_human(lag.max(0) as u64)
            )),
            None => out.push_str("replication lag: n/a\n"),
        }

        out.push_str(&format!(
            "{:<12} {:<10} {:>10}\n",
            "node", "status", "heartbeat"
        ));
        for node in &self.nodes {
            out.push_str(&format!(
                "{:<12} {:<10} {:>9.1}s\n",
                node.node_id, node.local_status, node.heartbeat_age
            ));
        }

        if self.nodes.is_empty() {
            out.push_str("(no live nodes)\n");
        }

        out
    }
}

/// Gather phase, membership and lag. Lag needs both sides: the change
/// log high-water mark lives on old, the applied cursor on next.
pub async fn fleet_status(old: &Session, next: &Session) -> Result<FleetStatus, Error> {
    let state = old
        .query_opt(
            "SELECT phase, version FROM switchover_state WHERE singleton",
            &[],
        )
        .await?;

    let (phase, version) = match state {
        Some(row) => {
            let phase: String = row.get(0);
            (phase.parse().unwrap_or(Phase::Idle), row.get::<_, i64>(1))
        }
        None => (Phase::Idle, 0),
    };

    let nodes = old
        .query(
            "SELECT node_id, local_status, \
                    EXTRACT(EPOCH FROM now() - last_heartbeat)::float8 \
             FROM switchover_nodes ORDER BY node_id",
            &[],
        )
        .await?
        .iter()
        .map(|row| NodeRow {
            node_id: row.get(0),
            local_status: row
                .get::<_, String>(1)
                .parse()
                .unwrap_or(LocalStatus::Unknown),
            heartbeat_age: row.get(2),
        })
        .collect();

    let lag = lag(old, next).await;

    Ok(FleetStatus {
        phase,
        version,
        lag,
        nodes,
    })
}

async fn lag(old: &Session, next: &Session) -> Option<i64> {
    let max_id: i64 = old
        .query_opt("SELECT COALESCE(max(id), 0) FROM change_log", &[])
        .await
        .ok()??
        .get(0);

    let cursor: i64 = next
        .query_opt(
            "SELECT last_change_id FROM switchover_sync_cursor WHERE singleton",
            &[],
        )
        .await
        .ok()??
        .get(0);

    Some((max_id - cursor).max(0))
}

/// Run the shell until the operator exits.
pub async fn run() -> Result<(), Error> {
    let config = config();
    let old = Address::new(Target::Old, &config.general.db_url)?;
    let next_url = config
        .general
        .db_url_next
        .clone()
        .ok_or(Error::SwitchoverDisabled)?;
    let next = Address::new(Target::Next, &next_url)?;

    let bus = Bus::new(old.clone());
    let old_session = Session::new(old);
    let next_session = Session::new(next);

    println!("pgswitch switchover shell; \"help\" lists commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_summary = String::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };

                if line.trim().is_empty() {
                    continue;
                }

                match line.parse::<Command>() {
                    Ok(Command::Exit) => break,
                    Ok(Command::Help) => println!("{}", HELP),
                    Ok(Command::Status) => {
                        match fleet_status(&old_session, &next_session).await {
                            Ok(status) => print!("{}", status.render()),
                            Err(err) => println!("status: {}", err),
                        }
                        let _ = std::io::stdout().flush();
                    }
                    Ok(command) => {
                        if let Err(err) = dispatch(command, &bus, &old_session).await {
                            println!("{}: {}", line.trim(), err);
                        }
                    }
                    Err(()) => {
                        println!("unknown command \"{}\"; \"help\" lists commands", line.trim());
                    }
                }
            }

            _ = ticker.tick() => {
                if let Ok(status) = fleet_status(&old_session, &next_session).await {
                    let summary = status.summary();
                    if summary != last_summary {
                        println!("{}", summary);
                        last_summary = summary;
                    }
                }
            }
        }
    }

    bus.shutdown();

    Ok(())
}

/// Translate a command into a bus message stamped with the cluster
/// state it was issued against.
async fn dispatch(command: Command, bus: &Bus, old: &Session) -> Result<(), Error> {
    let Some(kind) = command.message_kind() else {
        return Ok(());
    };

    let (phase, version) = match old
        .query_opt(
            "SELECT phase, version FROM switchover_state WHERE singleton",
            &[],
        )
        .await?
    {
        Some(row) => {
            let phase: String = row.get(0);
            (phase.parse().unwrap_or(Phase::Idle), row.get::<_, i64>(1))
        }
        None => (Phase::Idle, 0),
    };

    bus.send(&Envelope::new(kind, phase, version)).await?;
    debug!("sent {} to the leader", kind);
    println!("{} sent", kind);

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn status() -> FleetStatus {
        FleetStatus {
            phase: Phase::Syncing,
            version: 3,
            lag: Some(1204),
            nodes: vec![
                NodeRow {
                    node_id: "1a2b3c4d".into(),
                    local_status: LocalStatus::Ready,
                    heartbeat_age: 0.4,
                },
                NodeRow {
                    node_id: "9f8e7d6c".into(),
                    local_status: LocalStatus::Ready,
                    heartbeat_age: 1.2,
                },
            ],
        }
    }

    #[test]
    fn test_summary() {
        assert_eq!(
            status().summary(),
            "phase=syncing v3 nodes=2 lag=1,204 rows"
        );
    }

    #[test]
    fn test_render_lists_nodes() {
        let rendered = status().render();
        assert!(rendered.starts_with("cluster phase: syncing (v3)\n"));
        assert!(rendered.contains("replication lag: 1,204 row(s)"));
        assert!(rendered.contains("1a2b3c4d"));
        assert!(rendered.contains("9f8e7d6c"));
    }

    #[test]
    fn test_render_no_nodes() {
        let status = FleetStatus {
            phase: Phase::Idle,
            version: 0,
            lag: None,
            nodes: vec![],
        };
        let rendered = status.render();
        assert!(rendered.contains("replication lag: n/a"));
        assert!(rendered.contains("(no live nodes)"));
    }
}
