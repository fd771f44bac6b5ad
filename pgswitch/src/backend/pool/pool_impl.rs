//! Connection pool for a single backend.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{lock_api::MutexGuard, Mutex, RawMutex};
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::backend::{Error, Retry, Server};

use super::{comms::Comms, inner::Inner, Address, Config, Guard, VersionTag};

/// Connection pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<InnerSync>,
}

struct InnerSync {
    addr: Address,
    config: Config,
    inner: Mutex<Inner>,
    comms: Comms,
    retry: Retry,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("addr", &self.inner.addr)
            .finish()
    }
}

impl Pool {
    /// Create new connection pool. Offline until launched.
    pub fn new(addr: Address, config: Config) -> Self {
        Self {
            inner: Arc::new(InnerSync {
                addr,
                config,
                inner: Mutex::new(Inner::new(config)),
                comms: Comms::default(),
                retry: Retry::default(),
            }),
        }
    }

    /// Bring the pool online.
    pub fn launch(&self) {
        self.lock().online = true;
    }

    /// Get a connection from the pool, tagged with the route version.
    pub async fn get(&self, tag: VersionTag) -> Result<Guard, Error> {
        match timeout(self.inner.config.checkout_timeout, self.get_internal()).await {
            Ok(Ok(server)) => Ok(Guard::new(self.clone(), server, tag)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::CheckoutTimeout),
        }
    }

    async fn get_internal(&self) -> Result<Box<Server>, Error> {
        enum Decision {
            Conn(Box<Server>),
            Connect,
            Wait,
            Paused,
        }

        loop {
            let decision = {
                let mut guard = self.lock();

                if !guard.online {
                    return Err(Error::Offline);
                }

                if guard.paused {
                    Decision::Paused
                } else if let Some(server) = guard.take() {
                    Decision::Conn(server)
                } else if guard.reserve() {
                    Decision::Connect
                } else {
                    Decision::Wait
                }
            };

            match decision {
                Decision::Conn(server) => {
                    if server.is_closed() {
                        // Died while idle. Slot frees up, try again.
                        let mut guard = self.lock();
                        guard.check_in(server, true);
                        continue;
                    }

                    return Ok(server);
                }

                Decision::Connect => match self.inner.retry.connect(&self.inner.addr).await {
                    Ok(server) => {
                        self.lock().register(server.backend_pid());
                        return Ok(Box::new(server));
                    }
                    Err(err) => {
                        let mut guard = self.lock();
                        guard.release_slot();
                        drop(guard);
                        self.inner.comms.returned.notify_one();
                        return Err(err);
                    }
                },

                // A return may race past the notification; the timeout
                // turns a missed wakeup into a retry.
                Decision::Wait => {
                    let returned = self.inner.comms.returned.notified();
                    let _ = timeout(Duration::from_millis(100), returned).await;
                }

                Decision::Paused => {
                    let ready = self.inner.comms.ready.notified();
                    let _ = timeout(Duration::from_millis(100), ready).await;
                }
            }
        }
    }

    /// Check the connection back into the pool, or destroy it.
    pub(super) fn checkin(&self, server: Box<Server>, discard: bool) {
        let kept = self.lock().check_in(server, discard);

        if !kept {
            debug!("closed returned connection [{}]", self.addr());
        }

        self.inner.comms.returned.notify_one();
    }

    /// Create a connection outside pool accounting.
    pub async fn standalone(&self) -> Result<Server, Error> {
        self.inner.retry.connect(&self.inner.addr).await
    }

    /// Stop handing out connections until resumed.
    pub fn pause(&self) {
        let mut guard = self.lock();
        guard.paused = true;
        guard.dump_idle();
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        self.inner.comms.ready.notify_waiters();
    }

    /// Close all idle connections. In-flight guards finish and are
    /// culled on check-in by their version tag.
    pub fn dump_idle(&self) {
        self.lock().dump_idle();
    }

    /// Wait for checked-out connections to come home.
    pub async fn drain(&self, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;

        loop {
            if self.taken_count() == 0 {
                return true;
            }

            if Instant::now() >= deadline {
                return false;
            }

            let returned = self.inner.comms.returned.notified();
            let _ = timeout(Duration::from_millis(25), returned).await;
        }
    }

    /// Shut the pool down; all connections are closed as they return.
    pub fn shutdown(&self) {
        let mut guard = self.lock();
        guard.online = false;
        guard.dump_idle();
        drop(guard);
        self.inner.comms.returned.notify_waiters();
        self.inner.comms.ready.notify_waiters();
    }

    pub fn taken_count(&self) -> usize {
        self.lock().taken_count()
    }

    pub fn taken_pids(&self) -> Vec<i32> {
        self.lock().taken_pids()
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle_count()
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count()
    }

    pub fn paused(&self) -> bool {
        self.lock().paused
    }

    pub fn addr(&self) -> &Address {
        &self.inner.addr
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, RawMutex, Inner> {
        self.inner.inner.lock()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::pool::Target;
    use std::sync::atomic::AtomicI64;

    fn pool() -> Pool {
        let addr = Address::new(Target::Old, "postgres://pgswitch@127.0.0.1:5432/pgswitch")
            .unwrap();
        Pool::new(
            addr,
            Config {
                max_open: 2,
                max_idle: 1,
                checkout_timeout: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test]
    async fn test_offline_pool_refuses() {
        let pool = pool();
        let tag = VersionTag::new(0, Arc::new(AtomicI64::new(0)));

        let err = pool.get(tag).await.unwrap_err();
        assert!(matches!(err, Error::Offline));
    }

    #[tokio::test]
    async fn test_drain_empty_pool() {
        let pool = pool();
        pool.launch();
        assert!(pool.drain(Duration::from_millis(10)).await);
    }
}
