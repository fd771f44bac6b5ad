//! Pool settings.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Maximum open connections, checked out or idle.
    pub max_open: usize,
    /// Idle connections beyond this are closed on check-in.
    pub max_idle: usize,
    /// How long an acquisition may wait for a connection.
    pub checkout_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let general = &crate::config::config().general;

        Self {
            max_open: general.db_max_open.max(1),
            max_idle: general.db_max_idle,
            checkout_timeout: general.checkout_timeout_duration(),
        }
    }
}
