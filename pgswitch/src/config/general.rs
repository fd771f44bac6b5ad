use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct General {
    /// Connection string for the authoritative database.
    #[serde(default = "General::db_url")]
    pub db_url: String,
    /// Connection string for the database we're moving to.
    /// Setting it enables switchover mode.
    #[serde(default = "General::db_url_next")]
    pub db_url_next: Option<String>,
    /// Key used to encrypt sensitive data at rest.
    #[serde(default = "General::data_encryption_key")]
    pub data_encryption_key: Option<String>,
    /// Previous encryption key, kept for re-encryption.
    #[serde(default = "General::data_encryption_key_old")]
    pub data_encryption_key_old: Option<String>,
    /// Address the API server binds to.
    #[serde(default = "General::listen")]
    pub listen: String,
    /// Serve the API only, no background processing.
    #[serde(default)]
    pub api_only: bool,
    /// Maximum number of open connections per backend.
    #[serde(default = "General::db_max_open")]
    pub db_max_open: usize,
    /// Maximum number of idle connections to keep per backend.
    #[serde(default = "General::db_max_idle")]
    pub db_max_idle: usize,
    /// Only one instance per region processes outbound messages.
    #[serde(default = "General::region_name")]
    pub region_name: String,
    /// Replace outbound notifiers with no-op stubs.
    #[serde(default)]
    pub stub_notifiers: bool,
    /// Log in JSON.
    #[serde(default)]
    pub json: bool,
    /// Debug-level logging.
    #[serde(default)]
    pub verbose: bool,
    /// Log errors only.
    #[serde(default)]
    pub log_errors_only: bool,
    /// Attempt connections multiple times on bad networks.
    #[serde(default = "General::connect_attempts")]
    pub connect_attempts: usize,
    /// Base delay between connection attempts, in ms. Doubles per
    /// attempt, capped at one second.
    #[serde(default = "General::connect_attempt_delay")]
    pub connect_attempt_delay: u64,
    /// How long to wait for a pooled connection, in ms.
    #[serde(default = "General::checkout_timeout")]
    pub checkout_timeout: u64,
    /// How long to wait for active work to finish when shutting down, in ms.
    #[serde(default = "General::shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for General {
    fn default() -> Self {
        Self {
            db_url: Self::db_url(),
            db_url_next: Self::db_url_next(),
            data_encryption_key: Self::data_encryption_key(),
            data_encryption_key_old: Self::data_encryption_key_old(),
            listen: Self::listen(),
            api_only: Self::env_bool("PGSWITCH_API_ONLY"),
            db_max_open: Self::db_max_open(),
            db_max_idle: Self::db_max_idle(),
            region_name: Self::region_name(),
            stub_notifiers: Self::env_bool("PGSWITCH_STUB_NOTIFIERS"),
            json: Self::env_bool("PGSWITCH_JSON"),
            verbose: Self::env_bool("PGSWITCH_VERBOSE"),
            log_errors_only: Self::env_bool("PGSWITCH_LOG_ERRORS_ONLY"),
            connect_attempts: Self::connect_attempts(),
            connect_attempt_delay: Self::connect_attempt_delay(),
            checkout_timeout: Self::checkout_timeout(),
            shutdown_timeout: Self::shutdown_timeout(),
        }
    }
}

impl General {
    fn env_or_default<T: std::str::FromStr>(env_var: &str, default: T) -> T {
        env::var(env_var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn env_string_or_default(env_var: &str, default: &str) -> String {
        env::var(env_var).unwrap_or_else(|_| default.to_string())
    }

    fn env_option_string(env_var: &str) -> Option<String> {
        env::var(env_var).ok().filter(|s| !s.is_empty())
    }

    fn env_bool(env_var: &str) -> bool {
        env::var(env_var)
            .ok()
            .and_then(|v| match v.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            })
            .unwrap_or(false)
    }

    fn db_url() -> String {
        Self::env_string_or_default("PGSWITCH_DB_URL", "")
    }

    fn db_url_next() -> Option<String> {
        Self::env_option_string("PGSWITCH_DB_URL_NEXT")
    }

    fn data_encryption_key() -> Option<String> {
        Self::env_option_string("PGSWITCH_DATA_ENCRYPTION_KEY")
    }

    fn data_encryption_key_old() -> Option<String> {
        Self::env_option_string("PGSWITCH_DATA_ENCRYPTION_KEY_OLD")
    }

    fn listen() -> String {
        Self::env_string_or_default("PGSWITCH_LISTEN", "127.0.0.1:8081")
    }

    fn db_max_open() -> usize {
        Self::env_or_default("PGSWITCH_DB_MAX_OPEN", 15)
    }

    fn db_max_idle() -> usize {
        Self::env_or_default("PGSWITCH_DB_MAX_IDLE", 5)
    }

    fn region_name() -> String {
        Self::env_string_or_default("PGSWITCH_REGION_NAME", "default")
    }

    fn connect_attempts() -> usize {
        Self::env_or_default("PGSWITCH_CONNECT_ATTEMPTS", 10)
    }

    fn connect_attempt_delay() -> u64 {
        Self::env_or_default("PGSWITCH_CONNECT_ATTEMPT_DELAY", 25)
    }

    fn checkout_timeout() -> u64 {
        Self::env_or_default("PGSWITCH_CHECKOUT_TIMEOUT", 5_000)
    }

    fn shutdown_timeout() -> u64 {
        Self::env_or_default(
            "PGSWITCH_SHUTDOWN_TIMEOUT",
            Duration::from_secs(30).as_millis() as u64,
        )
    }

    pub(crate) fn checkout_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout)
    }

    pub(crate) fn connect_attempt_delay_duration(&self) -> Duration {
        Duration::from_millis(self.connect_attempt_delay)
    }

    pub(crate) fn shutdown_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout)
    }
}
