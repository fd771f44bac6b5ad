//! pgswitch: zero-downtime live switchover coordinator for
//! PostgreSQL.
//!
//! Routes a service's SQL to exactly one of two databases, keeps the
//! second in sync through trigger-based change capture, and
//! coordinates all replicas over LISTEN/NOTIFY so they flip at the
//! same logical moment.

pub mod backend;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod migrate;
pub mod selftest;
pub mod shell;
pub mod shutdown;
pub mod switchover;
pub mod sync;
pub mod util;

use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use backend::{pool, Address, Router, Target};
use engine::MetricsCycle;
use error::ErrorKind;
use switchover::{Bus, Handler, Nodes, PhaseStore, Session};

/// Initialize tracing from the logging switches. Safe to call more
/// than once; later calls are no-ops.
pub fn logger() {
    let general = &config::config().general;

    let default = if general.log_errors_only {
        "error"
    } else if general.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if general.json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

/// Run the service until the shutdown token fires: routing, engine
/// cycles, and (when a next database is configured) the switchover
/// handler.
pub async fn run(shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::config();

    let old = Address::new(Target::Old, &config.general.db_url)?;
    let next = match &config.general.db_url_next {
        Some(url) => Some(Address::new(Target::Next, url)?),
        None => None,
    };

    let router = Router::new(old.clone(), next.clone(), pool::Config::default());
    let tracker = TaskTracker::new();

    if !config.general.api_only {
        let cycle_router = router.clone();
        let token = shutdown.clone();
        let every = config.engine.cycle_interval_duration();

        tracker.spawn(async move {
            let cycle = MetricsCycle::new();
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = cycle.run(&cycle_router).await {
                            match err.kind() {
                                ErrorKind::Cancelled => {}
                                // Transient: the saved cursor makes the
                                // next invocation pick up where this one
                                // rolled back.
                                ErrorKind::Unavailable => {
                                    debug!("metrics cycle postponed: {}", err)
                                }
                                _ => error!("metrics cycle: {}", err),
                            }
                        }
                    }
                }
            }
        });
    }

    if let Some(next_addr) = next {
        let session = Arc::new(Session::new(old.clone()));
        let bus = Bus::new(old.clone());
        let nodes = Nodes::new(
            session.clone(),
            util::instance_id(),
            config.switchover.heartbeat_interval_duration(),
        );
        let phases = PhaseStore::new(session);

        let handler = Handler::new(
            router.clone(),
            bus.clone(),
            nodes,
            phases,
            old,
            next_addr,
            shutdown.child_token(),
        );

        tracker.spawn(async move { handler.run().await });

        let token = shutdown.clone();
        tracker.spawn(async move {
            token.cancelled().await;
            bus.shutdown();
        });

        info!("switchover enabled, this is node {}", util::instance_id());
    }

    info!(
        "pgswitch running (region={}, listen={})",
        config.general.region_name, config.general.listen
    );

    shutdown.cancelled().await;
    info!("draining background work");

    tracker.close();
    if tokio::time::timeout(config.general.shutdown_timeout_duration(), tracker.wait())
        .await
        .is_err()
    {
        warn!("shutdown timeout expired with work still running");
    }

    router.shutdown();

    Ok(())
}
