//! Backend addresses.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::Error;

/// Which physical database a statement lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    #[default]
    Old,
    Next,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Old => write!(f, "old"),
            Target::Next => write!(f, "next"),
        }
    }
}

impl FromStr for Target {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "old" => Ok(Target::Old),
            "next" => Ok(Target::Next),
            _ => Err(()),
        }
    }
}

/// Parsed connection info for one backend. Parsing happens once, at
/// construction, so a bad URL is a validation error instead of ten
/// useless connect retries.
#[derive(Clone)]
pub struct Address {
    target: Target,
    pg: tokio_postgres::Config,
    dbname: String,
}

impl Address {
    pub fn new(target: Target, url: &str) -> Result<Self, Error> {
        let pg: tokio_postgres::Config = url.parse()?;
        let dbname = pg.get_dbname().unwrap_or("postgres").to_string();

        Ok(Self { target, pg, dbname })
    }

    pub fn pg_config(&self) -> &tokio_postgres::Config {
        &self.pg
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.target, self.dbname)
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Address")
            .field("target", &self.target)
            .field("dbname", &self.dbname)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse() {
        let addr = Address::new(Target::Old, "postgres://app@localhost:5432/alerting").unwrap();
        assert_eq!(addr.target(), Target::Old);
        assert_eq!(addr.dbname(), "alerting");
        assert_eq!(addr.to_string(), "old/alerting");
    }

    #[test]
    fn test_bad_url() {
        assert!(Address::new(Target::Next, "not a url at all\0").is_err());
    }

    #[test]
    fn test_target_round_trip() {
        for target in [Target::Old, Target::Next] {
            assert_eq!(target.to_string().parse::<Target>().unwrap(), target);
        }
    }
}
