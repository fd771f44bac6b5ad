//! Retry driver.
//!
//! Wraps connection establishment and idempotent statements with
//! bounded attempts. Transient failures (connection refused, admin
//! shutdown, pool exhausted) back off exponentially with jitter,
//! capped at about a second; logical errors propagate immediately.

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::debug;

use crate::config::config;

use super::{pool::Address, Error, Server};

const BACKOFF_CAP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Retry {
    attempts: usize,
    base_delay: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        let general = &config().general;
        Self {
            attempts: general.connect_attempts,
            base_delay: general.connect_attempt_delay_duration(),
        }
    }
}

impl Retry {
    pub fn new(attempts: usize, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Connect, retrying transient failures.
    pub async fn connect(&self, addr: &Address) -> Result<Server, Error> {
        let mut attempt = 0;

        loop {
            match Server::connect(addr).await {
                Ok(server) => return Ok(server),
                Err(Error::Pg(err)) if super::pg_transient(&err) => {
                    attempt += 1;
                    if attempt >= self.attempts {
                        return Err(Error::ConnectAttempts(err));
                    }

                    let delay = self.delay(attempt);
                    debug!(
                        "connect attempt {}/{} failed, retrying in {:?}: {} [{}]",
                        attempt, self.attempts, delay, err, addr
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run an idempotent statement, retrying transient failures.
    /// Nothing has been returned to the caller before a retry, so
    /// replaying is safe only because the caller promises idempotence.
    pub async fn execute(
        &self,
        server: &Server,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, Error> {
        let mut attempt = 0;

        loop {
            match server.execute(sql, params).await {
                Ok(rows) => return Ok(rows),
                Err(err) if err.transient() && !server.is_closed() => {
                    attempt += 1;
                    if attempt >= self.attempts {
                        return Err(err);
                    }
                    sleep(self.delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Idempotent query variant of [`Self::execute`].
    pub async fn query(
        &self,
        server: &Server,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, Error> {
        let mut attempt = 0;

        loop {
            match server.query(sql, params).await {
                Ok(rows) => return Ok(rows),
                Err(err) if err.transient() && !server.is_closed() => {
                    attempt += 1;
                    if attempt >= self.attempts {
                        return Err(err);
                    }
                    sleep(self.delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Exponential backoff with jitter, capped.
    fn delay(&self, attempt: usize) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16) as u32)
            .min(BACKOFF_CAP);
        let jitter = rand::rng().random_range(0..=exp.as_millis() as u64 / 2);

        exp + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_backoff_capped() {
        let retry = Retry::new(10, Duration::from_millis(25));

        for attempt in 1..20 {
            let delay = retry.delay(attempt);
            // Cap plus at most half the cap of jitter.
            assert!(delay <= BACKOFF_CAP + BACKOFF_CAP / 2);
            assert!(delay >= Duration::from_millis(25));
        }
    }

    #[test]
    fn test_backoff_grows() {
        let retry = Retry::new(10, Duration::from_millis(25));
        // Jitter aside, the floor of each delay doubles.
        assert!(retry.delay(3) >= Duration::from_millis(25 * 8));
    }

    #[test]
    fn test_at_least_one_attempt() {
        let retry = Retry::new(0, Duration::from_millis(1));
        assert_eq!(retry.attempts, 1);
    }
}
