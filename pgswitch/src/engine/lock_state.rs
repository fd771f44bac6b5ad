//! Advisory-locked state store.
//!
//! Each engine cycle owns one JSON state blob in `engine_state`,
//! keyed by processing type. A transaction-scoped advisory lock on
//! the key makes the load-mutate-save sequence single-writer across
//! the whole fleet; commit is the only moment new state becomes
//! visible.

use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{de::DeserializeOwned, Serialize};
use tokio_postgres::Transaction;

use crate::backend::Server;

use super::Error;

pub struct StateStore {
    processing_type: String,
    lock_key: i64,
}

impl StateStore {
    pub fn new(processing_type: &str) -> Self {
        let mut hasher = FnvHasher::default();
        hasher.write(b"pgswitch.engine_state.");
        hasher.write(processing_type.as_bytes());

        Self {
            processing_type: processing_type.to_string(),
            lock_key: hasher.finish() as i64,
        }
    }

    pub fn processing_type(&self) -> &str {
        &self.processing_type
    }

    /// Open a transaction holding this cycle's advisory lock. The
    /// lock releases with the transaction, commit or rollback.
    pub async fn begin<'a>(&'a self, server: &'a mut Server) -> Result<StateTx<'a>, Error> {
        let tx = server.transaction().await?;
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&self.lock_key])
            .await?;

        Ok(StateTx {
            tx,
            processing_type: &self.processing_type,
        })
    }
}

pub struct StateTx<'a> {
    tx: Transaction<'a>,
    processing_type: &'a str,
}

impl<'a> StateTx<'a> {
    /// Load the state blob, or its default if none was saved yet.
    pub async fn load<T: DeserializeOwned + Default>(&self) -> Result<T, Error> {
        let row = self
            .tx
            .query_opt(
                "SELECT state FROM engine_state WHERE processing_type = $1",
                &[&self.processing_type],
            )
            .await?;

        match row {
            Some(row) => Ok(serde_json::from_value(row.get(0))?),
            None => Ok(T::default()),
        }
    }

    pub async fn save<T: Serialize>(&self, state: &T) -> Result<(), Error> {
        let blob = serde_json::to_value(state)?;
        self.tx
            .execute(
                "INSERT INTO engine_state (processing_type, state, updated_at) \
                 VALUES ($1, $2, now()) \
                 ON CONFLICT (processing_type) DO UPDATE \
                 SET state = EXCLUDED.state, updated_at = now()",
                &[&self.processing_type, &blob],
            )
            .await?;

        Ok(())
    }

    /// The underlying transaction, for the cycle's own statements.
    pub fn tx(&self) -> &Transaction<'a> {
        &self.tx
    }

    pub async fn commit(self) -> Result<(), Error> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lock_keys_differ_by_type() {
        let metrics = StateStore::new("metrics");
        let cleanup = StateStore::new("cleanup");
        assert_ne!(metrics.lock_key, cleanup.lock_key);
    }

    #[test]
    fn test_lock_key_stable() {
        assert_eq!(
            StateStore::new("metrics").lock_key,
            StateStore::new("metrics").lock_key
        );
    }
}
