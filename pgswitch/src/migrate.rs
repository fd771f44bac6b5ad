//! Schema migrations.
//!
//! The core schema ships embedded and applies in a fixed order, one
//! transaction per step, recorded in `switchover_migrations`. Both
//! databases must carry the same applied prefix before a switchover
//! can be trusted.

use thiserror::Error as ThisError;
use tracing::info;

use crate::backend::Server;
use crate::error::ErrorKind;

pub struct Migration {
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "switchover-state",
        up: "\
CREATE TABLE IF NOT EXISTS switchover_state (
    singleton BOOL PRIMARY KEY DEFAULT TRUE CHECK (singleton),
    phase TEXT NOT NULL DEFAULT 'idle',
    version BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
INSERT INTO switchover_state (singleton) VALUES (TRUE) ON CONFLICT DO NOTHING;",
        down: "DROP TABLE IF EXISTS switchover_state;",
    },
    Migration {
        name: "switchover-nodes",
        up: "\
CREATE TABLE IF NOT EXISTS switchover_nodes (
    node_id TEXT PRIMARY KEY,
    last_heartbeat TIMESTAMPTZ NOT NULL DEFAULT now(),
    local_status TEXT NOT NULL DEFAULT 'unknown'
);",
        down: "DROP TABLE IF EXISTS switchover_nodes;",
    },
    Migration {
        name: "engine-state",
        up: "\
CREATE TABLE IF NOT EXISTS engine_state (
    processing_type TEXT PRIMARY KEY,
    state JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);",
        down: "DROP TABLE IF EXISTS engine_state;",
    },
    Migration {
        name: "change-log",
        up: "\
CREATE TABLE IF NOT EXISTS change_log (
    id BIGSERIAL PRIMARY KEY,
    table_name TEXT NOT NULL,
    op TEXT NOT NULL CHECK (op IN ('I', 'U', 'D')),
    row_key JSONB NOT NULL,
    row_data JSONB,
    committed_at TIMESTAMPTZ NOT NULL DEFAULT now()
);",
        down: "DROP TABLE IF EXISTS change_log;",
    },
    Migration {
        name: "alerts",
        up: "\
CREATE TABLE IF NOT EXISTS alerts (
    id BIGSERIAL PRIMARY KEY,
    service_id TEXT NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'triggered'
        CHECK (status IN ('triggered', 'active', 'closed')),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);",
        down: "DROP TABLE IF EXISTS alerts;",
    },
    Migration {
        name: "alert-metrics",
        up: "\
CREATE TABLE IF NOT EXISTS alert_metrics (
    alert_id BIGINT PRIMARY KEY,
    service_id TEXT NOT NULL,
    closed_at TIMESTAMPTZ NOT NULL,
    time_to_close INTERVAL NOT NULL
);",
        down: "DROP TABLE IF EXISTS alert_metrics;",
    },
    Migration {
        name: "alert-metrics-daily",
        up: "\
CREATE TABLE IF NOT EXISTS alert_metrics_daily (
    date DATE NOT NULL,
    service_id TEXT NOT NULL,
    alert_count BIGINT NOT NULL,
    avg_time_to_close INTERVAL NOT NULL,
    PRIMARY KEY (date, service_id)
);",
        down: "DROP TABLE IF EXISTS alert_metrics_daily;",
    },
];

const BOOKKEEPING_DDL: &str = "\
CREATE TABLE IF NOT EXISTS switchover_migrations (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("{0}")]
    Backend(#[from] crate::backend::Error),

    #[error("unknown migration \"{0}\"")]
    Unknown(String),

    #[error("database has \"{applied}\" applied where \"{expected}\" was expected")]
    OutOfOrder { applied: String, expected: String },

    #[error("database has {count} migration(s) beyond the embedded set")]
    Unexpected { count: usize },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Backend(err) => err.kind(),
            _ => ErrorKind::Validation,
        }
    }
}

fn index_of(name: &str) -> Result<usize, Error> {
    MIGRATIONS
        .iter()
        .position(|m| m.name == name)
        .ok_or_else(|| Error::Unknown(name.to_string()))
}

/// The applied names must be a prefix of the embedded set.
fn check_prefix(applied: &[String]) -> Result<(), Error> {
    if applied.len() > MIGRATIONS.len() {
        return Err(Error::Unexpected {
            count: applied.len() - MIGRATIONS.len(),
        });
    }

    for (i, name) in applied.iter().enumerate() {
        if MIGRATIONS[i].name != name.as_str() {
            return Err(Error::OutOfOrder {
                applied: name.clone(),
                expected: MIGRATIONS[i].name.to_string(),
            });
        }
    }

    Ok(())
}

async fn applied(server: &Server) -> Result<Vec<String>, Error> {
    server.batch(BOOKKEEPING_DDL).await?;

    Ok(server
        .query("SELECT name FROM switchover_migrations ORDER BY id", &[])
        .await?
        .iter()
        .map(|row| row.get(0))
        .collect())
}

/// Apply pending migrations, optionally stopping after `up_to`.
/// Returns how many steps ran.
pub async fn up(server: &mut Server, up_to: Option<&str>) -> Result<usize, Error> {
    let applied = applied(server).await?;
    check_prefix(&applied)?;

    let end = match up_to {
        Some(name) => index_of(name)? + 1,
        None => MIGRATIONS.len(),
    };

    let mut count = 0;
    for migration in MIGRATIONS.iter().take(end).skip(applied.len()) {
        let tx = server.transaction().await?;
        tx.batch_execute(migration.up)
            .await
            .map_err(crate::backend::Error::from)?;
        tx.execute(
            "INSERT INTO switchover_migrations (name) VALUES ($1)",
            &[&migration.name],
        )
        .await
        .map_err(crate::backend::Error::from)?;
        tx.commit().await.map_err(crate::backend::Error::from)?;

        info!("migration \"{}\" applied", migration.name);
        count += 1;
    }

    Ok(count)
}

/// Revert applied migrations down to (and excluding) `down_to`.
pub async fn down(server: &mut Server, down_to: &str) -> Result<usize, Error> {
    let applied = applied(server).await?;
    check_prefix(&applied)?;

    let keep = index_of(down_to)? + 1;
    let mut count = 0;

    for name in applied.iter().skip(keep).rev() {
        let migration = &MIGRATIONS[index_of(name)?];

        let tx = server.transaction().await?;
        tx.batch_execute(migration.down)
            .await
            .map_err(crate::backend::Error::from)?;
        tx.execute(
            "DELETE FROM switchover_migrations WHERE name = $1",
            &[&migration.name],
        )
        .await
        .map_err(crate::backend::Error::from)?;
        tx.commit().await.map_err(crate::backend::Error::from)?;

        info!("migration \"{}\" reverted", migration.name);
        count += 1;
    }

    Ok(count)
}

/// Confirm the database carries exactly the embedded set.
pub async fn verify(server: &Server) -> Result<(), Error> {
    let applied = applied(server).await?;
    check_prefix(&applied)?;

    if applied.len() != MIGRATIONS.len() {
        return Err(Error::OutOfOrder {
            applied: format!("{} of {} migrations", applied.len(), MIGRATIONS.len()),
            expected: MIGRATIONS
                .last()
                .map(|m| m.name.to_string())
                .unwrap_or_default(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_names_unique() {
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            for other in &MIGRATIONS[i + 1..] {
                assert_ne!(migration.name, other.name);
            }
        }
    }

    #[test]
    fn test_every_up_has_a_down() {
        for migration in MIGRATIONS {
            assert!(!migration.up.is_empty());
            assert!(!migration.down.is_empty());
        }
    }

    #[test]
    fn test_prefix_check() {
        assert!(check_prefix(&[]).is_ok());
        assert!(check_prefix(&["switchover-state".into()]).is_ok());
        assert!(check_prefix(&[
            "switchover-state".into(),
            "switchover-nodes".into()
        ])
        .is_ok());

        let err = check_prefix(&["switchover-nodes".into()]).unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { .. }));
    }

    #[test]
    fn test_unknown_name() {
        assert!(matches!(index_of("nope"), Err(Error::Unknown(_))));
        assert_eq!(index_of("switchover-state").unwrap(), 0);
    }
}
