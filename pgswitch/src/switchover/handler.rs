//! Per-replica switchover state machine.
//!
//! Every replica runs one handler. It heartbeats its membership row,
//! reacts to coordination-bus messages, and flips its routing
//! connector on `flip`. The leader (lowest live node id) additionally
//! drives phase transitions: it owns the sync engine, collects acks,
//! and decides freeze, flip and abort.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Address, Router, Target};
use crate::config::Switchover as Settings;
use crate::sync::{changelog, SyncEngine};

use super::{Bus, Envelope, Error, LocalStatus, MessageKind, Nodes, Phase, PhaseStore};

#[derive(Clone)]
pub struct Handler {
    inner: Arc<Inner>,
}

struct Inner {
    router: Router,
    bus: Bus,
    nodes: Nodes,
    phases: PhaseStore,
    old_addr: Address,
    next_addr: Address,
    settings: Settings,
    sync: Mutex<Option<SyncEngine>>,
    local: Mutex<LocalStatus>,
    acks: Mutex<AckTable>,
    last_seen: Mutex<i64>,
    last_announce: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

/// Acks collected by the leader, keyed by message kind and the phase
/// version they apply to.
#[derive(Default)]
struct AckTable {
    entries: HashMap<(MessageKind, i64), HashSet<String>>,
}

impl AckTable {
    fn record(&mut self, kind: MessageKind, version: i64, sender: String) {
        self.entries.entry((kind, version)).or_default().insert(sender);
    }

    fn senders(&self, kind: MessageKind, version: i64) -> HashSet<String> {
        self.entries
            .get(&(kind, version))
            .cloned()
            .unwrap_or_default()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Reset only applies to a settled switchover; anything mid-flight
/// must be aborted first.
fn reset_allowed(phase: Phase) -> bool {
    phase.terminal() || phase == Phase::Idle
}

/// A phase conflict while forcing abort means another node already
/// aborted or completed; there is nothing left to do.
fn abort_already_settled(err: &Error) -> bool {
    matches!(err, Error::PhaseConflict { .. })
}

impl Handler {
    pub fn new(
        router: Router,
        bus: Bus,
        nodes: Nodes,
        phases: PhaseStore,
        old_addr: Address,
        next_addr: Address,
        cancel: CancellationToken,
    ) -> Self {
        let settings = crate::config::config().switchover.clone();

        Self {
            inner: Arc::new(Inner {
                router,
                bus,
                nodes,
                phases,
                old_addr,
                next_addr,
                settings,
                sync: Mutex::new(None),
                local: Mutex::new(LocalStatus::Unknown),
                acks: Mutex::new(AckTable::default()),
                last_seen: Mutex::new(0),
                last_announce: Mutex::new(None),
                cancel,
            }),
        }
    }

    /// Main loop. Runs until cancelled.
    pub async fn run(&self) {
        if let Err(err) = self.recover().await {
            warn!("switchover recovery: {}", err);
        }

        let mut rx = self.inner.bus.subscribe();
        let mut beat = interval(self.inner.settings.heartbeat_interval_duration());
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,

                result = rx.recv() => match result {
                    Ok(envelope) => {
                        if let Err(err) = self.handle(envelope).await {
                            warn!("switchover message: {}", err);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("bus fanout lagged, {} message(s) dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                _ = beat.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!("switchover heartbeat: {}", err);
                    }
                }
            }
        }

        let _ = self.inner.nodes.deregister().await;
        if let Some(engine) = self.engine() {
            engine.stop();
        }
    }

    /// A replica joining (or restarting into) a cluster that already
    /// cut over must route to next immediately.
    async fn recover(&self) -> Result<(), Error> {
        let state = self.inner.phases.get().await?;
        *self.inner.last_seen.lock() = state.version;

        if state.phase == Phase::Complete {
            self.inner.router.set_mode(Target::Next, state.version);
            self.set_local(LocalStatus::Flipped);
        }

        self.inner.nodes.beat(self.local()).await?;

        Ok(())
    }

    async fn handle(&self, envelope: Envelope) -> Result<(), Error> {
        debug!(
            "bus recv {} from {} (phase={}, v{})",
            envelope.kind, envelope.sender, envelope.phase, envelope.version
        );

        if envelope.kind.operator() {
            // Operator commands carry no version; the leader resolves
            // them against current state.
            if !self.inner.nodes.is_leader().await? {
                return Ok(());
            }

            return match envelope.kind {
                MessageKind::Enable => self.on_enable().await,
                MessageKind::Execute => self.on_execute().await,
                MessageKind::Abort => self.abort("operator abort").await,
                MessageKind::Reset => self.on_reset().await,
                MessageKind::Pause => {
                    if let Some(engine) = self.engine() {
                        engine.pause();
                    }
                    Ok(())
                }
                MessageKind::Resume => {
                    if let Some(engine) = self.engine() {
                        engine.resume();
                    }
                    Ok(())
                }
                MessageKind::SyncCheck => {
                    if let Some(engine) = self.engine() {
                        engine.check_now();
                    }
                    Ok(())
                }
                _ => Ok(()),
            };
        }

        match envelope.kind {
            MessageKind::Phase | MessageKind::Flip => {
                // Out-of-order and stale announcements are dropped;
                // the version total-orders transitions.
                let mut last_seen = self.inner.last_seen.lock();
                if envelope.version < *last_seen {
                    debug!(
                        "dropping stale {} (v{} < v{})",
                        envelope.kind, envelope.version, *last_seen
                    );
                    return Ok(());
                }
                *last_seen = envelope.version;
            }
            MessageKind::Ack | MessageKind::Frozen => {
                self.inner
                    .acks
                    .lock()
                    .record(envelope.kind, envelope.version, envelope.sender);
                return Ok(());
            }
            _ => {}
        }

        match envelope.kind {
            MessageKind::Phase => self.on_phase(envelope).await,
            MessageKind::Flip => self.on_flip(envelope).await,
            _ => Ok(()),
        }
    }

    /// Leader heartbeat duties: refresh membership, prune the dead,
    /// and advance the phases that move on observed conditions rather
    /// than on messages.
    async fn tick(&self) -> Result<(), Error> {
        self.inner.nodes.beat(self.local()).await?;

        if !self.inner.nodes.is_leader().await? {
            return Ok(());
        }

        self.inner.nodes.prune().await?;

        let state = self.inner.phases.get().await?;
        match state.phase {
            Phase::SyncPending => self.leader_check_sync_pending(state.version).await,
            Phase::Syncing => self.leader_check_syncing().await,
            _ => Ok(()),
        }
    }

    // Leader: operator asked to enable switchover.
    async fn on_enable(&self) -> Result<(), Error> {
        let state = self.inner.phases.get().await?;
        if state.phase != Phase::Idle {
            warn!("enable ignored, cluster is {}", state.phase);
            return Ok(());
        }

        let version = self.inner.phases.cas(Phase::Idle, Phase::SyncPending).await?;
        info!("switchover enabled (v{})", version);

        let handler = self.clone();
        tokio::spawn(async move {
            let engine =
                SyncEngine::new(handler.inner.old_addr.clone(), handler.inner.next_addr.clone());

            match engine.attach().await {
                Ok(()) => {
                    *handler.inner.sync.lock() = Some(engine);
                    let _ = handler
                        .announce(Phase::SyncPending, version)
                        .await
                        .map_err(|err| warn!("announce sync_pending: {}", err));
                }
                Err(err) => {
                    let _ = handler.abort(&format!("attach failed: {}", err)).await;
                }
            }
        });

        Ok(())
    }

    // Leader: everyone acked sync_pending and triggers are in; start
    // copying.
    async fn leader_check_sync_pending(&self, version: i64) -> Result<(), Error> {
        let Some(engine) = self.engine() else {
            return Ok(());
        };

        let live = self.inner.nodes.live().await?;
        let acked = self.inner.acks.lock().senders(MessageKind::Ack, version);

        if live.is_empty() || !live.iter().all(|n| acked.contains(&n.node_id)) {
            // Delivery is at-least-once: acks still missing after the
            // ack window mean the announcement was lost, so resend it.
            let overdue = match *self.inner.last_announce.lock() {
                Some(at) => at.elapsed() > self.inner.settings.ack_timeout_duration(),
                None => true,
            };
            if overdue {
                self.announce(Phase::SyncPending, version).await?;
            }
            return Ok(());
        }

        let version = self.inner.phases.cas(Phase::SyncPending, Phase::Syncing).await?;
        engine.start();
        self.announce(Phase::Syncing, version).await?;
        info!("sync started (v{})", version);

        Ok(())
    }

    // Leader: promote to ready once the engine holds its lag streak,
    // or abort if it errored. Also re-adopts the engine after a
    // leader change.
    async fn leader_check_syncing(&self) -> Result<(), Error> {
        let engine = match self.engine() {
            Some(engine) => engine,
            None => {
                // We inherited leadership mid-sync. Attach is
                // idempotent and accumulated change rows replay.
                let engine = SyncEngine::new(
                    self.inner.old_addr.clone(),
                    self.inner.next_addr.clone(),
                );
                engine.attach().await?;
                engine.start();
                *self.inner.sync.lock() = Some(engine.clone());
                info!("sync engine re-adopted after leader change");
                engine
            }
        };

        if engine.errored() {
            return self.abort("sync engine error").await;
        }

        if engine.ready() {
            let version = self.inner.phases.cas(Phase::Syncing, Phase::Ready).await?;
            self.announce(Phase::Ready, version).await?;
            info!("sync caught up, cluster ready (v{})", version);
        }

        Ok(())
    }

    // Leader: operator pulled the trigger.
    async fn on_execute(&self) -> Result<(), Error> {
        let state = self.inner.phases.get().await?;
        if state.phase != Phase::Ready {
            warn!("execute ignored, cluster is {}", state.phase);
            return Ok(());
        }

        let Some(engine) = self.engine() else {
            return self.abort("execute without sync engine").await;
        };

        if !engine.ready() {
            warn!("execute ignored, sync fell behind");
            return Ok(());
        }

        let handler = self.clone();
        tokio::spawn(async move {
            if let Err(err) = handler.execute_cutover(engine).await {
                let _ = handler.abort(&err.to_string()).await;
            }
        });

        Ok(())
    }

    /// The cutover sequence: freeze the fleet, drain the change log
    /// to zero, confirm liveness, flip. Everything from the freeze
    /// signal to the final drain must land inside one freeze budget;
    /// past it, the cluster aborts.
    async fn execute_cutover(&self, engine: SyncEngine) -> Result<(), Error> {
        let version = self.inner.phases.cas(Phase::Ready, Phase::Executing).await?;
        info!("executing switchover (v{})", version);

        // The executing announcement doubles as the freeze signal.
        let deadline = Instant::now() + self.inner.settings.freeze_budget_duration();
        self.announce(Phase::Executing, version).await?;

        self.wait_all(MessageKind::Frozen, version, deadline).await?;

        // No writes can arrive now; the log must drain completely
        // before the budget runs out.
        engine
            .wait_caught_up(deadline.saturating_duration_since(Instant::now()))
            .await?;

        // Final liveness round before the point of no return.
        let live = self.inner.nodes.live().await?;
        let frozen = self
            .inner
            .acks
            .lock()
            .senders(MessageKind::Frozen, version);
        if !live.iter().all(|n| frozen.contains(&n.node_id)) {
            return Err(Error::Aborted("node lost during freeze".into()));
        }

        self.inner
            .bus
            .send(&Envelope::new(MessageKind::Flip, Phase::Executing, version))
            .await?;

        let version = self.inner.phases.cas(Phase::Executing, Phase::Complete).await?;
        self.announce(Phase::Complete, version).await?;
        info!("switchover complete (v{})", version);

        // Leave capture in place for a grace period, then tear down.
        let handler = self.clone();
        tokio::spawn(async move {
            sleep(handler.inner.settings.detach_grace_duration()).await;
            engine.stop();
            if let Err(err) = engine.detach().await {
                warn!("post-cutover detach: {}", err);
            }
            *handler.inner.sync.lock() = None;
        });

        Ok(())
    }

    // Every node: a phase announcement from the leader.
    async fn on_phase(&self, envelope: Envelope) -> Result<(), Error> {
        match envelope.phase {
            Phase::SyncPending => {
                self.set_local(LocalStatus::Ready);
                self.inner
                    .bus
                    .send(&Envelope::new(
                        MessageKind::Ack,
                        envelope.phase,
                        envelope.version,
                    ))
                    .await?;
            }

            Phase::Executing => {
                // Freeze: no new transactions, drain in-flight, then
                // report. Runs off the handler loop so heartbeats
                // keep flowing.
                let handler = self.clone();
                tokio::spawn(async move {
                    handler.freeze_and_report(envelope.version).await;
                });
            }

            Phase::Aborted => {
                self.inner.router.thaw();
                self.set_local(LocalStatus::Unknown);
                if let Some(engine) = self.engine() {
                    engine.stop();
                }
                info!("switchover aborted, staying on old (v{})", envelope.version);
            }

            Phase::Idle => {
                self.set_local(LocalStatus::Unknown);
                self.inner.acks.lock().clear();
            }

            Phase::Syncing | Phase::Ready | Phase::Complete => {}
        }

        Ok(())
    }

    async fn freeze_and_report(&self, version: i64) {
        self.inner.router.freeze();
        self.set_local(LocalStatus::Armed);
        info!("freezing traffic (v{})", version);

        let drained = self
            .inner
            .router
            .drain(self.inner.settings.freeze_budget_duration())
            .await;

        if drained {
            let _ = self
                .inner
                .bus
                .send(&Envelope::new(MessageKind::Frozen, Phase::Executing, version))
                .await
                .map_err(|err| warn!("frozen ack: {}", err));
        } else {
            // In-flight transactions outlived the freeze budget.
            // Terminate them so nothing straddles the phase, then
            // call the whole thing off.
            warn!("freeze budget exceeded with transactions in flight");
            if let Err(err) = self.inner.router.terminate_in_flight().await {
                warn!("terminate in-flight: {}", err);
            }
            let _ = self
                .inner
                .bus
                .send(&Envelope::new(MessageKind::Abort, Phase::Executing, version))
                .await;
        }
    }

    // Every node: the flip itself.
    async fn on_flip(&self, envelope: Envelope) -> Result<(), Error> {
        self.inner
            .router
            .set_mode(Target::Next, envelope.version + 1);
        self.inner.router.thaw();
        self.set_local(LocalStatus::Flipped);
        info!("flipped to next (v{})", envelope.version + 1);

        Ok(())
    }

    // Leader: reset a finished or aborted switchover back to idle.
    async fn on_reset(&self) -> Result<(), Error> {
        let state = self.inner.phases.get().await?;
        if !reset_allowed(state.phase) {
            warn!("reset ignored, cluster is {}", state.phase);
            return Ok(());
        }

        if let Some(engine) = self.engine() {
            engine.stop();
        }
        *self.inner.sync.lock() = None;

        // Manual cleanup of capture plumbing; the bare change log
        // comes back so engine cycles keep their event source.
        let cleanup = async {
            let server = crate::backend::Retry::default()
                .connect(&self.inner.old_addr)
                .await?;
            changelog::detach(&server).await?;
            server.batch(changelog::CHANGE_LOG_DDL).await?;
            Ok::<(), crate::sync::Error>(())
        };
        if let Err(err) = cleanup.await {
            warn!("reset cleanup: {}", err);
        }

        let version = self.inner.phases.reset().await?;
        self.inner.acks.lock().clear();
        self.announce(Phase::Idle, version).await?;
        info!("switchover reset (v{})", version);

        Ok(())
    }

    /// Force the cluster into aborted and tell everyone. Always
    /// leaves old authoritative; triggers stay for the next attempt.
    async fn abort(&self, reason: &str) -> Result<(), Error> {
        warn!("aborting switchover: {}", reason);

        let version = match self.inner.phases.force(Phase::Aborted).await {
            Ok(version) => version,
            Err(err) if abort_already_settled(&err) => return Ok(()),
            Err(err) => return Err(err),
        };

        if let Some(engine) = self.engine() {
            engine.stop();
        }
        self.inner.router.thaw();

        self.announce(Phase::Aborted, version).await?;

        Ok(())
    }

    /// Wait until every live node has acked. Past the deadline, fail
    /// with the number of nodes still missing.
    async fn wait_all(
        &self,
        kind: MessageKind,
        version: i64,
        deadline: Instant,
    ) -> Result<(), Error> {
        loop {
            let live = self.inner.nodes.live().await?;
            let acked = self.inner.acks.lock().senders(kind, version);

            if !live.is_empty() && live.iter().all(|n| acked.contains(&n.node_id)) {
                return Ok(());
            }

            if Instant::now() >= deadline {
                let missing = live
                    .iter()
                    .filter(|n| !acked.contains(&n.node_id))
                    .count()
                    .max(1);
                debug!("{} node(s) missing {} ack (v{})", missing, kind, version);
                return Err(Error::AckTimeout { missing });
            }

            sleep(Duration::from_millis(50)).await;
        }
    }

    async fn announce(&self, phase: Phase, version: i64) -> Result<(), Error> {
        self.inner
            .bus
            .send(&Envelope::new(MessageKind::Phase, phase, version))
            .await?;
        *self.inner.last_announce.lock() = Some(Instant::now());

        Ok(())
    }

    fn engine(&self) -> Option<SyncEngine> {
        self.inner.sync.lock().clone()
    }

    pub fn local(&self) -> LocalStatus {
        *self.inner.local.lock()
    }

    fn set_local(&self, status: LocalStatus) {
        *self.inner.local.lock() = status;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::pool;
    use crate::switchover::Session;

    // Port 1 never has a listener; none of these tests may touch a
    // database, and an accidental statement fails loudly instead of
    // hanging.
    fn handler() -> Handler {
        let old = Address::new(Target::Old, "postgres://app@127.0.0.1:1/old").unwrap();
        let next = Address::new(Target::Next, "postgres://app@127.0.0.1:1/next").unwrap();

        let session = Arc::new(Session::new(old.clone()));
        let bus = Bus::new(old.clone());
        let nodes = Nodes::new(session.clone(), "aabbccdd", Duration::from_secs(1));
        let phases = PhaseStore::new(session);
        let router = Router::new(old.clone(), Some(next.clone()), pool::Config::default());

        Handler::new(
            router,
            bus,
            nodes,
            phases,
            old,
            next,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_ack_table() {
        let mut acks = AckTable::default();
        acks.record(MessageKind::Frozen, 3, "node-a".into());
        acks.record(MessageKind::Frozen, 3, "node-b".into());
        acks.record(MessageKind::Frozen, 3, "node-a".into());
        acks.record(MessageKind::Ack, 3, "node-c".into());

        let frozen = acks.senders(MessageKind::Frozen, 3);
        assert_eq!(frozen.len(), 2);
        assert!(frozen.contains("node-a"));
        assert!(frozen.contains("node-b"));
        assert!(!frozen.contains("node-c"));

        // Other versions and kinds are separate buckets.
        assert!(acks.senders(MessageKind::Frozen, 4).is_empty());
        assert_eq!(acks.senders(MessageKind::Ack, 3).len(), 1);

        acks.clear();
        assert!(acks.senders(MessageKind::Frozen, 3).is_empty());
    }

    #[tokio::test]
    async fn test_flip_retargets_router() {
        let handler = handler();

        handler
            .handle(Envelope::new(MessageKind::Flip, Phase::Executing, 5))
            .await
            .unwrap();

        let route = handler.inner.router.route();
        assert_eq!(route.target, Target::Next);
        assert_eq!(route.version, 6);
        assert_eq!(handler.local(), LocalStatus::Flipped);
        assert!(!handler.inner.router.frozen());
    }

    #[tokio::test]
    async fn test_stale_announcements_dropped() {
        let handler = handler();
        handler
            .handle(Envelope::new(MessageKind::Flip, Phase::Executing, 5))
            .await
            .unwrap();

        // A flip from an earlier version arrives late; it must not
        // touch the router.
        handler
            .handle(Envelope::new(MessageKind::Flip, Phase::Executing, 2))
            .await
            .unwrap();
        assert_eq!(handler.inner.router.route().version, 6);

        // A stale sync_pending would otherwise ack on the bus (and
        // fail, since there is no database behind these tests).
        handler
            .handle(Envelope::new(MessageKind::Phase, Phase::SyncPending, 1))
            .await
            .unwrap();
        assert_eq!(handler.local(), LocalStatus::Flipped);
    }

    #[tokio::test]
    async fn test_executing_announcement_freezes_router() {
        let handler = handler();

        handler
            .handle(Envelope::new(MessageKind::Phase, Phase::Executing, 4))
            .await
            .unwrap();

        // The freeze task runs off the handler loop.
        tokio::task::yield_now().await;
        assert!(handler.inner.router.frozen());
        assert_eq!(handler.local(), LocalStatus::Armed);
    }

    #[tokio::test]
    async fn test_aborted_announcement_thaws_router() {
        let handler = handler();
        handler.inner.router.freeze();

        handler
            .handle(Envelope::new(MessageKind::Phase, Phase::Aborted, 7))
            .await
            .unwrap();

        assert!(!handler.inner.router.frozen());
        assert_eq!(handler.local(), LocalStatus::Unknown);
    }

    #[test]
    fn test_reset_allowed_only_when_settled() {
        assert!(reset_allowed(Phase::Idle));
        assert!(reset_allowed(Phase::Complete));
        assert!(reset_allowed(Phase::Aborted));

        assert!(!reset_allowed(Phase::SyncPending));
        assert!(!reset_allowed(Phase::Syncing));
        assert!(!reset_allowed(Phase::Ready));
        assert!(!reset_allowed(Phase::Executing));
    }

    #[test]
    fn test_abort_settled_on_phase_conflict() {
        assert!(abort_already_settled(&Error::PhaseConflict {
            expected: Phase::Idle
        }));
        assert!(!abort_already_settled(&Error::AckTimeout { missing: 1 }));
        assert!(!abort_already_settled(&Error::NotLeader));
    }
}
