//! Coordination bus.
//!
//! LISTEN/NOTIFY on the old database, fanned out to local subscribers
//! through a broadcast channel. The listener reconnects on failure;
//! delivery is at-least-once and de-duplicated by message id.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

use crate::backend::{Address, Error as BackendError, Server};

use super::message::{Dedup, CHANNEL};
use super::{Envelope, Error, Session};

const FANOUT_CAPACITY: usize = 128;

#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

struct Inner {
    addr: Address,
    fanout: broadcast::Sender<Envelope>,
    sender: Session,
    seen: Mutex<Dedup>,
    shutdown: Notify,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus").field("addr", &self.inner.addr).finish()
    }
}

impl Bus {
    /// Create the bus and launch the listener task.
    pub fn new(addr: Address) -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);

        let bus = Self {
            inner: Arc::new(Inner {
                addr: addr.clone(),
                fanout,
                sender: Session::new(addr),
                seen: Mutex::new(Dedup::default()),
                shutdown: Notify::new(),
            }),
        };

        let task = bus.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task.inner.shutdown.notified() => break,
                    result = task.serve() => {
                        if let Err(err) = result {
                            error!("bus listener error: {} [{}]", err, task.inner.addr);
                        }
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        bus
    }

    /// Receive every message published on the channel, own ones
    /// included.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.fanout.subscribe()
    }

    /// Publish a message to the cluster.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), Error> {
        let payload = envelope.encode()?;
        self.inner
            .sender
            .execute("SELECT pg_notify($1, $2)", &[&CHANNEL, &payload])
            .await?;

        debug!(
            "bus sent {} (phase={}, v{})",
            envelope.kind, envelope.phase, envelope.version
        );

        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.notify_waiters();
    }

    async fn serve(&self) -> Result<(), BackendError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = Server::connect_listening(&self.inner.addr, tx).await?;
        server.batch(&format!("LISTEN {}", CHANNEL)).await?;

        info!("bus listening on \"{}\" [{}]", CHANNEL, self.inner.addr);

        while let Some(notification) = rx.recv().await {
            if notification.channel() != CHANNEL {
                continue;
            }

            let Some(envelope) = Envelope::parse(notification.payload()) else {
                // Non-JSON or unknown type, not ours to judge.
                continue;
            };

            if !self.inner.seen.lock().insert(envelope.msg_id) {
                continue;
            }

            // Send fails only with no subscribers, which is fine.
            let _ = self.inner.fanout.send(envelope);
        }

        // The channel closing means the connection died.
        drop(server);
        Err(BackendError::ConnectionClosed)
    }
}
