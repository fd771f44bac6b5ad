//! CDC sync engine.
//!
//! Captures row changes on the old database through triggers and a
//! change log, bulk-copies existing rows, then tails the log until
//! the next database is caught up. Only old serves writes while the
//! engine runs, so a real apply conflict means divergence and is
//! fatal.

pub mod changelog;
pub mod copy;
pub mod table;
pub mod tail;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error as ThisError;
use tokio::sync::Notify;
use tokio::time::{interval, sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backend::{Address, Retry, Server};
use crate::config::config;
use crate::error::ErrorKind;

use copy::BatchTuner;
use table::TrackedTable;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("{0}")]
    Backend(#[from] crate::backend::Error),

    #[error("table \"{0}\" has no primary key")]
    NoPrimaryKey(String),

    #[error("bulk copy batch timed out on \"{0}\"")]
    CopyTimeout(String),

    #[error("apply conflict on \"{table}\": {source}")]
    Conflict {
        table: String,
        #[source]
        source: crate::backend::Error,
    },

    #[error("change production outpaced apply for too long")]
    LagDiverging,

    #[error("sync did not catch up within budget")]
    CatchUpTimeout,

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Classify an apply failure: transient errors bubble up as
    /// retryable, anything logical is divergence.
    pub(crate) fn apply(table: &str, err: crate::backend::Error) -> Self {
        if err.transient() {
            Error::Backend(err)
        } else {
            Error::Conflict {
                table: table.to_string(),
                source: err,
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Backend(err) => err.kind(),
            Error::NoPrimaryKey(_) => ErrorKind::Validation,
            Error::CopyTimeout(_) => ErrorKind::Unavailable,
            Error::Conflict { .. } => ErrorKind::Fatal,
            Error::LagDiverging | Error::CatchUpTimeout => ErrorKind::Aborted,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Engine-internal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Attach,
    BulkCopy,
    Tail,
    CaughtUp,
    Error,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use SyncPhase::*;
        match self {
            Attach => write!(f, "attach"),
            BulkCopy => write!(f, "bulk_copy"),
            Tail => write!(f, "tail"),
            CaughtUp => write!(f, "caught_up"),
            Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub phase: SyncPhase,
    pub tables_total: usize,
    pub tables_done: usize,
    pub copied_rows: u64,
    pub cursor: i64,
    pub lag: i64,
    pub ready: bool,
    pub error: Option<String>,
}

const CURSOR_DDL: &str = "\
CREATE TABLE IF NOT EXISTS switchover_sync_cursor (
    singleton BOOL PRIMARY KEY DEFAULT TRUE CHECK (singleton),
    last_change_id BIGINT NOT NULL DEFAULT 0,
    last_applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    old: Address,
    next: Address,
    retry: Retry,
    progress: Mutex<Progress>,
    tables: Mutex<Vec<TrackedTable>>,
    paused: AtomicBool,
    kick: Notify,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("progress", &self.progress())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(old: Address, next: Address) -> Self {
        Self {
            inner: Arc::new(Inner {
                old,
                next,
                retry: Retry::default(),
                progress: Mutex::new(Progress::default()),
                tables: Mutex::new(Vec::new()),
                paused: AtomicBool::new(false),
                kick: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Install change capture on old and the cursor on next.
    /// Idempotent; re-attach after an abort picks up accumulated rows.
    pub async fn attach(&self) -> Result<(), Error> {
        let old = self.inner.retry.connect(&self.inner.old).await?;
        let tables = changelog::discover_tables(&old).await?;
        changelog::attach(&old, &tables).await?;

        let next = self.inner.retry.connect(&self.inner.next).await?;
        next.batch(CURSOR_DDL).await?;
        next.execute(
            "INSERT INTO switchover_sync_cursor (singleton) VALUES (TRUE) \
             ON CONFLICT DO NOTHING",
            &[],
        )
        .await?;

        {
            let mut progress = self.inner.progress.lock();
            progress.tables_total = tables.len();
        }
        *self.inner.tables.lock() = tables;

        Ok(())
    }

    /// Launch bulk copy and tail in the background.
    pub fn start(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.run().await {
                Ok(()) => {}
                Err(Error::Cancelled) => {}
                Err(err) => {
                    error!("sync engine failed: {}", err);
                    let mut progress = engine.inner.progress.lock();
                    progress.phase = SyncPhase::Error;
                    progress.ready = false;
                    progress.error = Some(err.to_string());
                }
            }
        });
    }

    async fn run(&self) -> Result<(), Error> {
        let settings = config().switchover.clone();
        let budget = settings.copy_batch_timeout_duration();
        let target = Duration::from_millis(settings.copy_batch_target);

        let old = self.inner.retry.connect(&self.inner.old).await?;
        let mut next = self.inner.retry.connect(&self.inner.next).await?;

        let cursor_row = next
            .query_one(
                "SELECT last_change_id FROM switchover_sync_cursor WHERE singleton",
                &[],
            )
            .await?;
        self.set_cursor(cursor_row.get(0));

        let tables = self.inner.tables.lock().clone();
        let by_name: HashMap<String, TrackedTable> = tables
            .iter()
            .cloned()
            .map(|table| (table.name.clone(), table))
            .collect();

        // Bulk copy, interleaved with tail so the change log doesn't
        // pile up while we stream history.
        self.set_phase(SyncPhase::BulkCopy);
        let mut tuner = BatchTuner::new(settings.copy_batch_size, target);

        for table in &tables {
            let mut offset = 0i64;

            loop {
                self.check_cancelled()?;
                self.drain_tail(&old, &mut next, &by_name, settings.apply_batch_size)
                    .await?;

                if self.paused() {
                    sleep(Duration::from_millis(200)).await;
                    continue;
                }

                let started = Instant::now();
                let copied = copy::copy_batch(
                    &old,
                    &next,
                    table,
                    offset,
                    tuner.size(),
                    budget,
                )
                .await?;

                if copied == 0 {
                    break;
                }

                offset += copied as i64;
                tuner.observe(started.elapsed());

                let mut progress = self.inner.progress.lock();
                progress.copied_rows += copied as u64;
            }

            let mut progress = self.inner.progress.lock();
            progress.tables_done += 1;
            info!("bulk copy of \"{}\" complete ({} rows)", table.name, offset);
        }

        // Tail until told to stop.
        self.set_phase(SyncPhase::Tail);
        let mut ticker = interval(Duration::from_secs(1));
        let mut streak = 0u32;
        let mut last_lag = i64::MAX;
        let mut growing_since: Option<Instant> = None;

        loop {
            self.check_cancelled()?;
            self.drain_tail(&old, &mut next, &by_name, settings.apply_batch_size)
                .await?;

            let lag = tail::lag(&old, self.cursor()).await?;

            if lag <= settings.lag_threshold {
                streak += 1;
            } else {
                streak = 0;
            }

            // Production persistently outpacing consumption poisons
            // the sync; operators must abort rather than wait forever.
            if lag > last_lag && lag > settings.lag_threshold {
                let since = growing_since.get_or_insert_with(Instant::now);
                if since.elapsed() > settings.lag_error_window_duration() {
                    return Err(Error::LagDiverging);
                }
            } else {
                growing_since = None;
            }
            last_lag = lag;

            let ready = streak >= settings.ready_samples;
            {
                let mut progress = self.inner.progress.lock();
                progress.lag = lag;
                progress.ready = ready;
                progress.phase = if ready {
                    SyncPhase::CaughtUp
                } else {
                    SyncPhase::Tail
                };
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.inner.kick.notified() => {}
                _ = self.inner.cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Apply pending change rows until the backlog is gone.
    async fn drain_tail(
        &self,
        old: &Server,
        next: &mut Server,
        tables: &HashMap<String, TrackedTable>,
        batch: i64,
    ) -> Result<(), Error> {
        loop {
            self.check_cancelled()?;

            match tail::tail_step(old, next, tables, self.cursor(), batch).await? {
                Some((cursor, applied)) => {
                    self.set_cursor(cursor);
                    if (applied as i64) < batch {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    /// Block until the change log is fully applied. Called during the
    /// freeze, when no new writes can arrive.
    pub async fn wait_caught_up(&self, budget: Duration) -> Result<(), Error> {
        let wait = async {
            loop {
                let progress = self.progress();
                if progress.phase == SyncPhase::Error {
                    return Err(Error::LagDiverging);
                }
                if matches!(progress.phase, SyncPhase::Tail | SyncPhase::CaughtUp)
                    && progress.lag == 0
                {
                    return Ok(());
                }

                self.inner.kick.notify_one();
                sleep(Duration::from_millis(50)).await;
            }
        };

        match timeout(budget, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::CatchUpTimeout),
        }
    }

    /// Re-sample lag now instead of at the next tick.
    pub fn check_now(&self) {
        self.inner.kick.notify_one();
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Relaxed);
        info!("bulk copy paused");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Relaxed);
        info!("bulk copy resumed");
    }

    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::Relaxed)
    }

    /// Stop the engine without touching triggers; accumulated change
    /// rows survive for the next attach.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Drop triggers and the change log on old. Only safe after the
    /// cluster has cut over (or an operator reset).
    pub async fn detach(&self) -> Result<(), Error> {
        let old = self.inner.retry.connect(&self.inner.old).await?;
        changelog::detach(&old).await
    }

    pub fn progress(&self) -> Progress {
        self.inner.progress.lock().clone()
    }

    pub fn ready(&self) -> bool {
        self.inner.progress.lock().ready
    }

    pub fn lag(&self) -> i64 {
        self.inner.progress.lock().lag
    }

    pub fn errored(&self) -> bool {
        self.inner.progress.lock().phase == SyncPhase::Error
    }

    fn cursor(&self) -> i64 {
        self.inner.progress.lock().cursor
    }

    fn set_cursor(&self, cursor: i64) {
        let mut progress = self.inner.progress.lock();
        // The sync cursor only advances.
        progress.cursor = progress.cursor.max(cursor);
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.inner.progress.lock().phase = phase;
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.inner.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::Target;

    fn engine() -> SyncEngine {
        let old =
            Address::new(Target::Old, "postgres://pgswitch@127.0.0.1:5432/old").unwrap();
        let next =
            Address::new(Target::Next, "postgres://pgswitch@127.0.0.1:5433/next").unwrap();
        SyncEngine::new(old, next)
    }

    #[test]
    fn test_cursor_only_advances() {
        let engine = engine();
        engine.set_cursor(10);
        engine.set_cursor(5);
        assert_eq!(engine.cursor(), 10);
        engine.set_cursor(11);
        assert_eq!(engine.cursor(), 11);
    }

    #[test]
    fn test_pause_resume() {
        let engine = engine();
        assert!(!engine.paused());
        engine.pause();
        assert!(engine.paused());
        engine.resume();
        assert!(!engine.paused());
    }

    #[test]
    fn test_apply_error_classification() {
        let err = Error::apply("alerts", crate::backend::Error::CheckoutTimeout);
        assert!(matches!(err, Error::Backend(_)));

        let err = Error::apply("alerts", crate::backend::Error::ConnectionClosed);
        assert!(matches!(err, Error::Backend(_)));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::LagDiverging.kind(), ErrorKind::Aborted);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::NoPrimaryKey("x".into()).kind(),
            ErrorKind::Validation
        );
    }
}
