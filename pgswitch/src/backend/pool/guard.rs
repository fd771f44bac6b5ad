//! Connection guard.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::backend::Server;

use super::Pool;

/// Route version stamped on a connection at acquisition.
/// A guard whose tag no longer matches the live version is stale:
/// it acquired under a phase that has since advanced.
#[derive(Clone)]
pub struct VersionTag {
    version: i64,
    current: Arc<AtomicI64>,
}

impl VersionTag {
    pub(crate) fn new(version: i64, current: Arc<AtomicI64>) -> Self {
        Self { version, current }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn stale(&self) -> bool {
        self.version != self.current.load(Ordering::Acquire)
    }
}

/// Checked-out connection. Returns to the pool on drop; destroyed
/// instead if the route version moved on while it was out.
pub struct Guard {
    server: Option<Box<Server>>,
    pool: Pool,
    tag: VersionTag,
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("connected", &self.server.is_some())
            .field("version", &self.tag.version())
            .finish()
    }
}

impl Guard {
    pub(super) fn new(pool: Pool, server: Box<Server>, tag: VersionTag) -> Self {
        Self {
            server: Some(server),
            pool,
            tag,
        }
    }

    pub fn tag(&self) -> &VersionTag {
        &self.tag
    }
}

impl Deref for Guard {
    type Target = Server;

    fn deref(&self) -> &Self::Target {
        self.server.as_ref().unwrap()
    }
}

impl DerefMut for Guard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.server.as_mut().unwrap()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            self.pool.checkin(server, self.tag.stale());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_version_tag_staleness() {
        let current = Arc::new(AtomicI64::new(3));
        let tag = VersionTag::new(3, current.clone());
        assert!(!tag.stale());

        current.store(4, Ordering::Release);
        assert!(tag.stale());
    }
}
