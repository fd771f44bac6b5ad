//! Reconnecting control-plane session.
//!
//! Bookkeeping statements (heartbeats, phase CAS, notify) bypass the
//! routing connector: they always target one fixed backend and must
//! keep working while application traffic is frozen.

use tokio::sync::Mutex;
use tokio_postgres::{types::ToSql, Row};

use crate::backend::{Address, Error, Retry, Server};

pub struct Session {
    addr: Address,
    retry: Retry,
    server: Mutex<Option<Server>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("addr", &self.addr).finish()
    }
}

impl Session {
    pub fn new(addr: Address) -> Self {
        Self {
            addr,
            retry: Retry::default(),
            server: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, Error> {
        let mut guard = self.server.lock().await;
        let server = self.ensure(&mut guard).await?;

        match server.query(sql, params).await {
            Ok(rows) => Ok(rows),
            Err(err) if err.transient() => {
                // One reconnect, then replay. Control-plane statements
                // are idempotent.
                *guard = None;
                let server = self.ensure(&mut guard).await?;
                server.query(sql, params).await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, Error> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, Error> {
        let mut guard = self.server.lock().await;
        let server = self.ensure(&mut guard).await?;

        match server.execute(sql, params).await {
            Ok(rows) => Ok(rows),
            Err(err) if err.transient() => {
                *guard = None;
                let server = self.ensure(&mut guard).await?;
                server.execute(sql, params).await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn batch(&self, sql: &str) -> Result<(), Error> {
        let mut guard = self.server.lock().await;
        let server = self.ensure(&mut guard).await?;
        server.batch(sql).await
    }

    async fn ensure<'a>(
        &self,
        guard: &'a mut Option<Server>,
    ) -> Result<&'a mut Server, Error> {
        if guard.as_ref().map(|s| s.is_closed()).unwrap_or(true) {
            *guard = Some(self.retry.connect(&self.addr).await?);
        }

        Ok(guard.as_mut().unwrap())
    }

    /// Drop the connection; the next statement reconnects.
    pub async fn close(&self) {
        *self.server.lock().await = None;
    }
}
