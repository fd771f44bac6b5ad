use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Tuning knobs for the switchover machinery. Defaults are safe for
/// production; the env overrides exist for integration testing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Switchover {
    /// Tables to copy and tail. Empty means every table in the public
    /// schema except our own bookkeeping tables.
    #[serde(default)]
    pub tables: Vec<String>,
    /// How long each node may block new transactions while the
    /// cluster drains in-flight work, in ms.
    #[serde(default = "Switchover::freeze_budget")]
    pub freeze_budget: u64,
    /// How long the leader waits for a coordination-bus ack, in ms.
    #[serde(default = "Switchover::ack_timeout")]
    pub ack_timeout: u64,
    /// Node heartbeat interval, in ms. A node is live if its heartbeat
    /// is within twice this interval.
    #[serde(default = "Switchover::heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Change-log rows the apply loop may trail by and still count
    /// as caught up.
    #[serde(default = "Switchover::lag_threshold")]
    pub lag_threshold: i64,
    /// Consecutive in-threshold lag samples before sync is ready.
    #[serde(default = "Switchover::ready_samples")]
    pub ready_samples: u32,
    /// Initial bulk-copy batch size. Auto-tunes toward the latency target.
    #[serde(default = "Switchover::copy_batch_size")]
    pub copy_batch_size: i64,
    /// Per-batch latency target for bulk copy, in ms.
    #[serde(default = "Switchover::copy_batch_target")]
    pub copy_batch_target: u64,
    /// Hard timeout for a single bulk-copy batch, in ms.
    #[serde(default = "Switchover::copy_batch_timeout")]
    pub copy_batch_timeout: u64,
    /// Maximum change-log rows applied per transaction.
    #[serde(default = "Switchover::apply_batch_size")]
    pub apply_batch_size: i64,
    /// If lag keeps growing for this long during tail, sync errors out, in ms.
    #[serde(default = "Switchover::lag_error_window")]
    pub lag_error_window: u64,
    /// How long a frozen acquisition waits before giving up, in ms.
    #[serde(default = "Switchover::acquire_block")]
    pub acquire_block: u64,
    /// Grace period after cutover before triggers are torn down, in ms.
    #[serde(default = "Switchover::detach_grace")]
    pub detach_grace: u64,
}

impl Default for Switchover {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            freeze_budget: Self::freeze_budget(),
            ack_timeout: Self::ack_timeout(),
            heartbeat_interval: Self::heartbeat_interval(),
            lag_threshold: Self::lag_threshold(),
            ready_samples: Self::ready_samples(),
            copy_batch_size: Self::copy_batch_size(),
            copy_batch_target: Self::copy_batch_target(),
            copy_batch_timeout: Self::copy_batch_timeout(),
            apply_batch_size: Self::apply_batch_size(),
            lag_error_window: Self::lag_error_window(),
            acquire_block: Self::acquire_block(),
            detach_grace: Self::detach_grace(),
        }
    }
}

impl Switchover {
    fn env_or_default<T: std::str::FromStr>(env_var: &str, default: T) -> T {
        env::var(env_var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn freeze_budget() -> u64 {
        Self::env_or_default("PGSWITCH_FREEZE_BUDGET", 5_000)
    }

    fn ack_timeout() -> u64 {
        Self::env_or_default("PGSWITCH_ACK_TIMEOUT", 2_000)
    }

    fn heartbeat_interval() -> u64 {
        Self::env_or_default("PGSWITCH_HEARTBEAT_INTERVAL", 1_000)
    }

    fn lag_threshold() -> i64 {
        Self::env_or_default("PGSWITCH_LAG_THRESHOLD", 10)
    }

    fn ready_samples() -> u32 {
        Self::env_or_default("PGSWITCH_READY_SAMPLES", 3)
    }

    fn copy_batch_size() -> i64 {
        Self::env_or_default("PGSWITCH_COPY_BATCH_SIZE", 1_000)
    }

    fn copy_batch_target() -> u64 {
        Self::env_or_default("PGSWITCH_COPY_BATCH_TARGET", 250)
    }

    fn copy_batch_timeout() -> u64 {
        Self::env_or_default("PGSWITCH_COPY_BATCH_TIMEOUT", 30_000)
    }

    fn apply_batch_size() -> i64 {
        Self::env_or_default("PGSWITCH_APPLY_BATCH_SIZE", 1_000)
    }

    fn lag_error_window() -> u64 {
        Self::env_or_default("PGSWITCH_LAG_ERROR_WINDOW", 60_000)
    }

    fn acquire_block() -> u64 {
        Self::env_or_default("PGSWITCH_ACQUIRE_BLOCK", 1_000)
    }

    fn detach_grace() -> u64 {
        Self::env_or_default("PGSWITCH_DETACH_GRACE", 10_000)
    }

    pub(crate) fn freeze_budget_duration(&self) -> Duration {
        Duration::from_millis(self.freeze_budget)
    }

    pub(crate) fn ack_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.ack_timeout)
    }

    pub(crate) fn heartbeat_interval_duration(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub(crate) fn copy_batch_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.copy_batch_timeout)
    }

    pub(crate) fn lag_error_window_duration(&self) -> Duration {
        Duration::from_millis(self.lag_error_window)
    }

    pub(crate) fn acquire_block_duration(&self) -> Duration {
        Duration::from_millis(self.acquire_block)
    }

    pub(crate) fn detach_grace_duration(&self) -> Duration {
        Duration::from_millis(self.detach_grace)
    }
}
