//! Self test.
//!
//! Offline: embedded migration parity and timezone arithmetic,
//! including the daylight-saving transitions that have bitten
//! on-call scheduling before. Online: both databases reachable and
//! carrying the same applied schema.

use chrono::{Duration as ChronoDuration, Offset, TimeZone};
use chrono_tz::America::Chicago;
use thiserror::Error as ThisError;
use tracing::info;

use crate::backend::{Address, Retry, Target};
use crate::config::config;
use crate::error::ErrorKind;
use crate::migrate;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("{0}")]
    Backend(#[from] crate::backend::Error),

    #[error("{0}")]
    Migrate(#[from] migrate::Error),

    #[error("DST rule check failed: {0}")]
    Dst(String),

    #[error("migration set inconsistent: {0}")]
    Parity(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Backend(err) => err.kind(),
            Error::Migrate(err) => err.kind(),
            Error::Dst(_) | Error::Parity(_) => ErrorKind::Fatal,
        }
    }
}

/// Run the self test. `offline` skips everything that needs a
/// database.
pub async fn run(offline: bool) -> Result<(), Error> {
    dst_rules()?;
    migration_parity()?;

    if offline {
        info!("self-test passed (offline)");
        return Ok(());
    }

    let retry = Retry::default();
    let general = &config().general;

    let old = Address::new(Target::Old, &general.db_url)?;
    let server = retry.connect(&old).await?;
    server.ping().await?;
    migrate::verify(&server).await?;
    info!("old database reachable and migrated [{}]", old);

    if let Some(url) = &general.db_url_next {
        let next = Address::new(Target::Next, url)?;
        let server = retry.connect(&next).await?;
        server.ping().await?;
        migrate::verify(&server).await?;
        info!("next database reachable and migrated [{}]", next);
    }

    info!("self-test passed");

    Ok(())
}

/// The embedded migration set must be internally consistent.
fn migration_parity() -> Result<(), Error> {
    for (i, migration) in migrate::MIGRATIONS.iter().enumerate() {
        for other in &migrate::MIGRATIONS[i + 1..] {
            if migration.name == other.name {
                return Err(Error::Parity(format!(
                    "duplicate migration name \"{}\"",
                    migration.name
                )));
            }
        }
    }

    Ok(())
}

/// Pin the America/Chicago 2020 DST transitions: spring forward on
/// March 8, fall back on November 1.
fn dst_rules() -> Result<(), Error> {
    // Before the spring jump: CST, UTC-6.
    let before = Chicago
        .with_ymd_and_hms(2020, 3, 8, 0, 30, 0)
        .single()
        .ok_or_else(|| Error::Dst("2020-03-08 00:30 should exist".into()))?;
    expect_offset("2020-03-08 00:30", before.offset().fix().local_minus_utc(), -21_600)?;

    // Three hours later we're past the jump: CDT, UTC-5.
    let after = before + ChronoDuration::hours(3);
    expect_offset("2020-03-08 +3h", after.offset().fix().local_minus_utc(), -18_000)?;

    // 02:30 never happens on that day.
    if Chicago
        .with_ymd_and_hms(2020, 3, 8, 2, 30, 0)
        .single()
        .is_some()
    {
        return Err(Error::Dst("2020-03-08 02:30 should not exist".into()));
    }

    // Reverse on November 1.
    let before = Chicago
        .with_ymd_and_hms(2020, 11, 1, 0, 30, 0)
        .single()
        .ok_or_else(|| Error::Dst("2020-11-01 00:30 should exist".into()))?;
    expect_offset("2020-11-01 00:30", before.offset().fix().local_minus_utc(), -18_000)?;

    let after = before + ChronoDuration::hours(3);
    expect_offset("2020-11-01 +3h", after.offset().fix().local_minus_utc(), -21_600)?;

    // 01:30 happens twice.
    let ambiguous = Chicago.with_ymd_and_hms(2020, 11, 1, 1, 30, 0);
    if ambiguous.earliest() == ambiguous.latest() {
        return Err(Error::Dst("2020-11-01 01:30 should be ambiguous".into()));
    }

    Ok(())
}

fn expect_offset(what: &str, got: i32, want: i32) -> Result<(), Error> {
    if got != want {
        return Err(Error::Dst(format!(
            "{}: offset {} != expected {}",
            what, got, want
        )));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dst_rules() {
        dst_rules().unwrap();
    }

    #[test]
    fn test_migration_parity() {
        migration_parity().unwrap();
    }

    #[tokio::test]
    async fn test_offline_run() {
        run(true).await.unwrap();
    }
}
