//! Routing connector.
//!
//! One logical database handle over two physical backends. Every
//! acquired connection is bound to exactly one backend and stamped
//! with the route version in force at acquisition; stale connections
//! are destroyed on release instead of returning to the pool.
//!
//! The freeze gate lives here too: while the cluster drains in-flight
//! work ahead of a flip, the router refuses to begin new work.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::info;

use crate::backend::Error;

use super::{Address, Config, Guard, Pool, Target, VersionTag};

/// Routing decision in force for new acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub target: Target,
    pub version: i64,
}

#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    old: Pool,
    next: Option<Pool>,
    route: ArcSwap<Route>,
    version: Arc<AtomicI64>,
    frozen: AtomicBool,
    thaw: Notify,
    acquire_block: Duration,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let route = self.route();
        f.debug_struct("Router")
            .field("target", &route.target)
            .field("version", &route.version)
            .finish()
    }
}

impl Router {
    pub fn new(old: Address, next: Option<Address>, config: Config) -> Self {
        let acquire_block = crate::config::config()
            .switchover
            .acquire_block_duration();

        let router = Self {
            inner: Arc::new(RouterInner {
                old: Pool::new(old, config),
                next: next.map(|addr| Pool::new(addr, config)),
                route: ArcSwap::from_pointee(Route {
                    target: Target::Old,
                    version: 0,
                }),
                version: Arc::new(AtomicI64::new(0)),
                frozen: AtomicBool::new(false),
                thaw: Notify::new(),
                acquire_block,
            }),
        };

        router.inner.old.launch();
        if let Some(next) = &router.inner.next {
            next.launch();
        }

        router
    }

    /// Acquire a connection bound to the current routing target.
    ///
    /// During a phase transition acquisition blocks for a short
    /// bounded interval, then fails as unavailable.
    pub async fn acquire(&self) -> Result<Guard, Error> {
        if self.frozen() {
            timeout(self.inner.acquire_block, self.thawed())
                .await
                .map_err(|_| Error::Frozen)?;
        }

        let route = self.route();
        let pool = self.pool(route.target)?;
        let tag = VersionTag::new(route.version, self.inner.version.clone());

        pool.get(tag).await
    }

    /// Refuse to start new work until thawed. In-flight connections
    /// keep going; `drain` waits for them.
    pub fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::Release);
    }

    /// Lift the freeze and wake everything blocked on it.
    pub fn thaw(&self) {
        self.inner.frozen.store(false, Ordering::Release);
        self.inner.thaw.notify_waiters();
    }

    pub fn frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::Acquire)
    }

    /// Resolves once the freeze lifts. Registers with the notifier
    /// before re-checking the flag, so a concurrent thaw can't slip
    /// between the two.
    async fn thawed(&self) {
        loop {
            let notified = self.inner.thaw.notified();
            if !self.frozen() {
                return;
            }
            notified.await;
        }
    }

    /// Atomically swap the routing target. All new acquisitions see
    /// the new target; in-flight connections finish, then die on
    /// release by version mismatch.
    pub fn set_mode(&self, target: Target, version: i64) {
        let previous = self.route();

        self.inner.route.store(Arc::new(Route { target, version }));
        self.inner.version.store(version, Ordering::Release);

        if previous.target != target {
            if let Ok(pool) = self.pool(previous.target) {
                pool.dump_idle();
            }
        }

        info!(
            "routing {} v{} -> {} v{}",
            previous.target, previous.version, target, version
        );
    }

    /// Wait for in-flight work to finish on both backends.
    pub async fn drain(&self, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;

        loop {
            if self.taken_count() == 0 {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(25).min(deadline - now)).await;
        }
    }

    /// Terminate backends still holding connections checked out of the
    /// active pool. Used when the freeze budget expires with
    /// transactions still open.
    pub async fn terminate_in_flight(&self) -> Result<usize, Error> {
        let route = self.route();
        let pool = self.pool(route.target)?;
        let pids = pool.taken_pids();

        if pids.is_empty() {
            return Ok(0);
        }

        let server = pool.standalone().await?;
        let mut terminated = 0;

        for pid in &pids {
            let row = server
                .query_one("SELECT pg_terminate_backend($1)", &[pid])
                .await?;
            if row.get::<_, bool>(0) {
                terminated += 1;
            }
        }

        info!("terminated {} in-flight backend(s)", terminated);

        Ok(terminated)
    }

    pub fn route(&self) -> Route {
        **self.inner.route.load()
    }

    pub fn version(&self) -> i64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn pool(&self, target: Target) -> Result<&Pool, Error> {
        match target {
            Target::Old => Ok(&self.inner.old),
            Target::Next => self.inner.next.as_ref().ok_or(Error::Offline),
        }
    }

    pub fn taken_count(&self) -> usize {
        let mut count = self.inner.old.taken_count();
        if let Some(next) = &self.inner.next {
            count += next.taken_count();
        }

        count
    }

    pub fn shutdown(&self) {
        self.inner.old.shutdown();
        if let Some(next) = &self.inner.next {
            next.shutdown();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn router() -> Router {
        let old =
            Address::new(Target::Old, "postgres://pgswitch@127.0.0.1:5432/old").unwrap();
        let next =
            Address::new(Target::Next, "postgres://pgswitch@127.0.0.1:5433/next").unwrap();

        Router::new(
            old,
            Some(next),
            Config {
                max_open: 2,
                max_idle: 1,
                checkout_timeout: Duration::from_millis(100),
            },
        )
    }

    #[test]
    fn test_set_mode_advances_version() {
        let router = router();
        assert_eq!(
            router.route(),
            Route {
                target: Target::Old,
                version: 0
            }
        );

        router.set_mode(Target::Next, 1);
        assert_eq!(router.route().target, Target::Next);
        assert_eq!(router.version(), 1);
    }

    #[test]
    fn test_next_pool_optional() {
        let old =
            Address::new(Target::Old, "postgres://pgswitch@127.0.0.1:5432/old").unwrap();
        let router = Router::new(old, None, Config::default());

        assert!(router.pool(Target::Next).is_err());
        assert!(router.pool(Target::Old).is_ok());
    }

    #[tokio::test]
    async fn test_drain_without_work() {
        let router = router();
        assert!(router.drain(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_frozen_acquire_fails_bounded() {
        let router = router();
        router.freeze();
        assert!(router.frozen());

        let err = router.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Frozen));
    }

    #[tokio::test]
    async fn test_thaw_wakes_blocked_acquisitions() {
        let router = router();
        router.freeze();

        let blocked = {
            let router = router.clone();
            tokio::spawn(async move { router.thawed().await })
        };

        // Let the blocked task register with the gate before lifting it.
        tokio::task::yield_now().await;
        router.thaw();

        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("thaw wakes waiters")
            .unwrap();
        assert!(!router.frozen());
    }
}
