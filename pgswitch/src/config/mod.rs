//! Configuration.

pub mod engine;
pub mod general;
pub mod switchover;

pub use engine::Engine;
pub use general::General;
pub use switchover::Switchover;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::error::ErrorKind;

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Load configuration.
pub fn config() -> Arc<Config> {
    CONFIG.load().clone()
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub switchover: Switchover,
    #[serde(default)]
    pub engine: Engine,
}

impl Config {
    /// Validate settings that have no usable default.
    pub fn check(&self) -> Result<(), Error> {
        if self.general.db_url.is_empty() {
            return Err(Error::MissingDbUrl);
        }

        Ok(())
    }

    /// Switchover mode is enabled by configuring the next database.
    pub fn switchover_enabled(&self) -> bool {
        self.general.db_url_next.is_some()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("db-url is required")]
    MissingDbUrl,

    #[error("I/O error on \"{0}\": {1}")]
    Io(String, #[source] std::io::Error),

    #[error("TOML parse error in \"{0}\": {1}")]
    Parse(String, #[source] toml::de::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Load the configuration file from disk and make it current.
pub fn load(path: &Path) -> Result<Arc<Config>, Error> {
    let name = path.display().to_string();
    let contents =
        std::fs::read_to_string(path).map_err(|err| Error::Io(name.clone(), err))?;
    let config: Config = toml::from_str(&contents).map_err(|err| Error::Parse(name, err))?;

    set(config)
}

/// Build configuration from environment variables alone.
pub fn from_env() -> Result<Arc<Config>, Error> {
    set(Config::default())
}

/// Make the given configuration current. Validation is the caller's
/// business: offline commands run fine without a database URL.
pub fn set(config: Config) -> Result<Arc<Config>, Error> {
    let config = Arc::new(config);
    CONFIG.store(config.clone());

    Ok(config)
}

/// Override some settings from CLI flags.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub db_url: Option<String>,
    pub db_url_next: Option<String>,
    pub json: Option<bool>,
    pub verbose: Option<bool>,
}

pub fn overrides(overrides: Overrides) {
    let mut config = (*config()).clone();
    let Overrides {
        db_url,
        db_url_next,
        json,
        verbose,
    } = overrides;

    if let Some(db_url) = db_url {
        config.general.db_url = db_url;
    }

    if let Some(db_url_next) = db_url_next {
        config.general.db_url_next = Some(db_url_next);
    }

    if let Some(json) = json {
        config.general.json = json;
    }

    if let Some(verbose) = verbose {
        config.general.verbose = verbose;
    }

    CONFIG.store(Arc::new(config));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_missing_db_url() {
        let config = Config::default();
        // Unless the environment provides one, the default is empty
        // and fails validation.
        if std::env::var("PGSWITCH_DB_URL").is_err() {
            assert!(config.check().is_err());
        }
    }

    #[test]
    fn test_parse_full() {
        let source = r#"
[general]
db_url = "postgres://app@old-db/app"
db_url_next = "postgres://app@next-db/app"
db_max_open = 20
region_name = "us-east"

[switchover]
freeze_budget = 2500
tables = ["alerts", "services"]

[engine]
cycle_interval = 1000
"#;
        let config: Config = toml::from_str(source).unwrap();
        assert!(config.check().is_ok());
        assert!(config.switchover_enabled());
        assert_eq!(config.general.db_max_open, 20);
        assert_eq!(config.general.region_name, "us-east");
        assert_eq!(config.switchover.freeze_budget, 2500);
        assert_eq!(config.switchover.tables, vec!["alerts", "services"]);
        assert_eq!(config.engine.cycle_interval, 1000);
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.switchover.ready_samples, 3);
        assert_eq!(config.switchover.freeze_budget, 5_000);
        assert_eq!(config.switchover.apply_batch_size, 1_000);
        assert!(!config.switchover_enabled());
    }
}
