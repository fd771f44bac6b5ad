//! Alert metrics cycle.
//!
//! Two passes, each in its own advisory-locked transaction: derive
//! per-alert metrics from recent change-log events, then roll up one
//! closed day at a time into daily aggregates.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::Router;
use crate::config::config;

use super::{Error, StateStore};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct MetricsState {
    /// Commit time of the newest processed change row. While a batch
    /// is non-empty this stays put and `last_log_id` walks forward;
    /// an empty batch snaps it to the server-time bound.
    pub last_log_time: Option<DateTime<Utc>>,
    /// Tie-breaker among change rows sharing `last_log_time`.
    pub last_log_id: i64,
    /// Most recent day already rolled up.
    pub last_metrics_date: Option<NaiveDate>,
}

const SCAN_SQL: &str = "\
SELECT id, committed_at FROM change_log \
WHERE (committed_at, id) > ($1, $2) AND committed_at <= $3 \
ORDER BY committed_at, id \
LIMIT $4";

const DERIVE_SQL: &str = "\
INSERT INTO alert_metrics (alert_id, service_id, closed_at, time_to_close) \
SELECT (c.row_data ->> 'id')::bigint, \
       COALESCE(c.row_data ->> 'service_id', ''), \
       c.committed_at, \
       c.committed_at - COALESCE((c.row_data ->> 'created_at')::timestamptz, c.committed_at) \
FROM change_log c \
WHERE c.id = ANY($1) \
  AND c.table_name = 'alerts' \
  AND c.row_data ->> 'status' = 'closed' \
ON CONFLICT (alert_id) DO NOTHING";

const DAILY_SQL: &str = "\
INSERT INTO alert_metrics_daily (date, service_id, alert_count, avg_time_to_close) \
SELECT $1::date, service_id, count(*), avg(time_to_close) \
FROM alert_metrics \
WHERE closed_at >= $1::date AND closed_at < $1::date + 1 \
GROUP BY service_id \
ON CONFLICT (date, service_id) DO NOTHING";

pub struct MetricsCycle {
    store: StateStore,
    batch_size: i64,
}

impl Default for MetricsCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCycle {
    pub fn new() -> Self {
        Self {
            store: StateStore::new("metrics"),
            batch_size: config().engine.batch_size,
        }
    }

    /// One engine-cycle invocation. Any error rolls back and leaves
    /// the cursor unchanged.
    pub async fn run(&self, router: &Router) -> Result<(), Error> {
        self.update_recent(router).await?;
        self.update_daily(router).await
    }

    async fn update_recent(&self, router: &Router) -> Result<(), Error> {
        let mut conn = router.acquire().await?;
        let state_tx = self.store.begin(&mut conn).await?;

        let mut state: MetricsState = state_tx.load().await?;

        let row = state_tx.tx().query_one("SELECT now()", &[]).await?;
        let bound_now: DateTime<Utc> = row.get(0);

        let since = state.last_log_time.unwrap_or(DateTime::UNIX_EPOCH);
        let rows = state_tx
            .tx()
            .query(
                SCAN_SQL,
                &[&since, &state.last_log_id, &bound_now, &self.batch_size],
            )
            .await?;

        if rows.is_empty() {
            // Caught up; snap to the bound and clear the tie-breaker.
            state.last_log_time = Some(bound_now);
            state.last_log_id = 0;
        } else {
            let ids: Vec<i64> = rows.iter().map(|row| row.get(0)).collect();
            let derived = state_tx.tx().execute(DERIVE_SQL, &[&ids]).await?;

            let last = rows.last().unwrap();
            state.last_log_time = Some(last.get(1));
            state.last_log_id = last.get(0);

            debug!(
                "metrics scanned {} event(s), derived {} row(s)",
                ids.len(),
                derived
            );
        }

        state_tx.save(&state).await?;
        state_tx.commit().await
    }

    /// Roll up the next finished day, strictly before the day the
    /// event cursor has reached.
    async fn update_daily(&self, router: &Router) -> Result<(), Error> {
        let mut conn = router.acquire().await?;
        let state_tx = self.store.begin(&mut conn).await?;

        let mut state: MetricsState = state_tx.load().await?;

        let Some(log_time) = state.last_log_time else {
            // No events processed yet, nothing to roll up.
            return state_tx.commit().await;
        };
        let boundary = log_time.date_naive();

        let next_date = match state.last_metrics_date {
            Some(date) => date + Days::new(1),
            None => {
                let row = state_tx
                    .tx()
                    .query_one("SELECT min(closed_at)::date FROM alert_metrics", &[])
                    .await?;
                match row.get::<_, Option<NaiveDate>>(0) {
                    Some(date) => date,
                    None => return state_tx.commit().await,
                }
            }
        };

        if next_date >= boundary {
            return state_tx.commit().await;
        }

        let rolled = state_tx.tx().execute(DAILY_SQL, &[&next_date]).await?;
        state.last_metrics_date = Some(next_date);

        debug!("daily rollup for {}: {} service(s)", next_date, rolled);

        state_tx.save(&state).await?;
        state_tx.commit().await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_state_defaults() {
        let state = MetricsState::default();
        assert!(state.last_log_time.is_none());
        assert_eq!(state.last_log_id, 0);
        assert!(state.last_metrics_date.is_none());
    }

    #[test]
    fn test_state_blob_round_trip() {
        let state = MetricsState {
            last_log_time: Some("2026-03-01T12:00:00Z".parse().unwrap()),
            last_log_id: 42,
            last_metrics_date: Some(NaiveDate::from_ymd_opt(2026, 2, 28).unwrap()),
        };

        let blob = serde_json::to_value(&state).unwrap();
        let back: MetricsState = serde_json::from_value(blob).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_state_blob_tolerates_missing_fields() {
        // Blobs written before a field existed still load.
        let back: MetricsState = serde_json::from_value(serde_json::json!({
            "last_log_id": 7
        }))
        .unwrap();
        assert_eq!(back.last_log_id, 7);
        assert!(back.last_log_time.is_none());
    }

    #[test]
    fn test_scan_orders_by_time_then_id() {
        assert!(SCAN_SQL.contains("(committed_at, id) > ($1, $2)"));
        assert!(SCAN_SQL.contains("ORDER BY committed_at, id"));
    }
}
