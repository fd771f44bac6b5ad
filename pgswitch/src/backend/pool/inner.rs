//! Pool state protected by the pool lock.

use std::collections::{HashSet, VecDeque};

use crate::backend::Server;

use super::Config;

pub(super) struct Inner {
    pub(super) online: bool,
    pub(super) paused: bool,
    /// Idle connections, most recently used last.
    idle: VecDeque<Box<Server>>,
    /// All open connections, including checked out and connecting.
    open: usize,
    /// Backend PIDs currently checked out.
    taken: HashSet<i32>,
    config: Config,
}

impl Inner {
    pub(super) fn new(config: Config) -> Self {
        Self {
            online: false,
            paused: false,
            idle: VecDeque::new(),
            open: 0,
            taken: HashSet::new(),
            config,
        }
    }

    /// Take an idle connection if one is available.
    pub(super) fn take(&mut self) -> Option<Box<Server>> {
        let server = self.idle.pop_back()?;
        self.taken.insert(server.backend_pid());

        Some(server)
    }

    /// Reserve a slot for a new connection. Caller must either
    /// register the connection or release the slot.
    pub(super) fn reserve(&mut self) -> bool {
        if self.open < self.config.max_open {
            self.open += 1;
            true
        } else {
            false
        }
    }

    pub(super) fn release_slot(&mut self) {
        self.open = self.open.saturating_sub(1);
    }

    pub(super) fn register(&mut self, pid: i32) {
        self.taken.insert(pid);
    }

    /// Return a connection. Returns true if it was kept.
    pub(super) fn check_in(&mut self, server: Box<Server>, discard: bool) -> bool {
        self.taken.remove(&server.backend_pid());

        if discard || !self.online || server.is_closed() || self.idle.len() >= self.config.max_idle
        {
            self.open = self.open.saturating_sub(1);
            false
        } else {
            self.idle.push_back(server);
            true
        }
    }

    /// Close all idle connections.
    pub(super) fn dump_idle(&mut self) {
        self.open = self.open.saturating_sub(self.idle.len());
        self.idle.clear();
    }

    pub(super) fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub(super) fn taken_count(&self) -> usize {
        self.taken.len()
    }

    pub(super) fn taken_pids(&self) -> Vec<i32> {
        self.taken.iter().copied().collect()
    }

    pub(super) fn open_count(&self) -> usize {
        self.open
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            max_open: 2,
            max_idle: 1,
            checkout_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_reserve_respects_max_open() {
        let mut inner = Inner::new(config());
        inner.online = true;

        assert!(inner.reserve());
        assert!(inner.reserve());
        assert!(!inner.reserve());

        inner.release_slot();
        assert!(inner.reserve());
        assert_eq!(inner.open_count(), 2);
    }

    #[test]
    fn test_take_empty() {
        let mut inner = Inner::new(config());
        inner.online = true;
        assert!(inner.take().is_none());
        assert_eq!(inner.taken_count(), 0);
    }
}
