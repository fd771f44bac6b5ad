use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Engine-cycle settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Engine {
    /// How often each engine cycle runs, in ms.
    #[serde(default = "Engine::cycle_interval")]
    pub cycle_interval: u64,
    /// Maximum change-log rows scanned per cycle.
    #[serde(default = "Engine::batch_size")]
    pub batch_size: i64,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            cycle_interval: Self::cycle_interval(),
            batch_size: Self::batch_size(),
        }
    }
}

impl Engine {
    fn env_or_default<T: std::str::FromStr>(env_var: &str, default: T) -> T {
        env::var(env_var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn cycle_interval() -> u64 {
        Self::env_or_default("PGSWITCH_ENGINE_CYCLE_INTERVAL", 5_000)
    }

    fn batch_size() -> i64 {
        Self::env_or_default("PGSWITCH_ENGINE_BATCH_SIZE", 500)
    }

    pub(crate) fn cycle_interval_duration(&self) -> Duration {
        Duration::from_millis(self.cycle_interval)
    }
}
