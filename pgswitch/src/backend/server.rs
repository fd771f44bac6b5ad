//! A single server connection.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_postgres::{
    tls::NoTls, types::ToSql, AsyncMessage, Notification, Row, Transaction,
};
use tracing::{debug, error};

use super::{pool::Address, Error};

/// One open connection to one backend.
pub struct Server {
    client: tokio_postgres::Client,
    addr: Address,
    backend_pid: i32,
    created_at: Instant,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("backend_pid", &self.backend_pid)
            .finish()
    }
}

impl Server {
    /// Connect to the backend. One attempt; the retry driver wraps this.
    pub async fn connect(addr: &Address) -> Result<Server, Error> {
        let (client, connection) = addr.pg_config().connect(NoTls).await?;

        let conn_addr = addr.clone();
        spawn(async move {
            if let Err(err) = connection.await {
                debug!("connection closed: {} [{}]", err, conn_addr);
            }
        });

        let row = client.query_one("SELECT pg_backend_pid()", &[]).await?;
        let backend_pid: i32 = row.get(0);

        Ok(Server {
            client,
            addr: addr.clone(),
            backend_pid,
            created_at: Instant::now(),
        })
    }

    /// Connect and forward asynchronous notifications to the channel.
    /// Used by the coordination bus; regular pool connections don't
    /// pay for the message stream.
    pub async fn connect_listening(
        addr: &Address,
        notifications: mpsc::UnboundedSender<Notification>,
    ) -> Result<Server, Error> {
        let (client, mut connection) = addr.pg_config().connect(NoTls).await?;

        let conn_addr = addr.clone();
        spawn(async move {
            let mut stream =
                futures::stream::poll_fn(move |cx| connection.poll_message(cx));

            while let Some(message) = stream.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if notifications.send(notification).is_err() {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        error!("listener connection error: {} [{}]", err, conn_addr);
                        break;
                    }
                }
            }
        });

        let row = client.query_one("SELECT pg_backend_pid()", &[]).await?;
        let backend_pid: i32 = row.get(0);

        Ok(Server {
            client,
            addr: addr.clone(),
            backend_pid,
            created_at: Instant::now(),
        })
    }

    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, Error> {
        Ok(self.client.query(sql, params).await?)
    }

    pub async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, Error> {
        Ok(self.client.query_one(sql, params).await?)
    }

    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, Error> {
        Ok(self.client.query_opt(sql, params).await?)
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, Error> {
        Ok(self.client.execute(sql, params).await?)
    }

    /// Run multiple statements separated by semicolons.
    pub async fn batch(&self, sql: &str) -> Result<(), Error> {
        Ok(self.client.batch_execute(sql).await?)
    }

    /// Begin a transaction. Dropping it without commit rolls back.
    pub async fn transaction(&mut self) -> Result<Transaction<'_>, Error> {
        Ok(self.client.transaction().await?)
    }

    pub async fn ping(&self) -> Result<(), Error> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    /// Server clock, not the client's.
    pub async fn now(&self) -> Result<DateTime<Utc>, Error> {
        let row = self.query_one("SELECT now()", &[]).await?;
        Ok(row.get(0))
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}
