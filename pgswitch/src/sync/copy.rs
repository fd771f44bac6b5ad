//! Bulk copy.
//!
//! Streams every tracked table from old to next in key order, in
//! batches sized to hit a latency target. Rows already on next are
//! upserted by primary key, so re-running a copy is harmless.

use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;

use crate::backend::Server;

use super::{table::TrackedTable, Error};

const MIN_BATCH: i64 = 100;
const MAX_BATCH: i64 = 10_000;

/// Adjusts the batch size toward a per-batch latency target.
#[derive(Debug, Clone)]
pub(crate) struct BatchTuner {
    size: i64,
    target: Duration,
}

impl BatchTuner {
    pub(crate) fn new(size: i64, target: Duration) -> Self {
        Self {
            size: size.clamp(MIN_BATCH, MAX_BATCH),
            target,
        }
    }

    pub(crate) fn size(&self) -> i64 {
        self.size
    }

    /// Observe one batch round trip.
    pub(crate) fn observe(&mut self, elapsed: Duration) {
        if elapsed > self.target {
            self.size = (self.size / 2).max(MIN_BATCH);
        } else if elapsed < self.target / 2 {
            self.size = (self.size * 2).min(MAX_BATCH);
        }
    }
}

/// Copy one batch of rows. Returns how many rows moved; zero means
/// the table is done.
pub(crate) async fn copy_batch(
    old: &Server,
    next: &Server,
    table: &TrackedTable,
    offset: i64,
    batch: i64,
    budget: Duration,
) -> Result<usize, Error> {
    let work = async {
        let rows = old
            .query(&table.select_batch_sql(), &[&batch, &offset])
            .await?;

        if rows.is_empty() {
            return Ok::<usize, Error>(0);
        }

        let images: Vec<Value> = rows.iter().map(|row| row.get(0)).collect();
        let count = images.len();

        next.execute(&table.upsert_sql(false), &[&Value::Array(images)])
            .await
            .map_err(|err| Error::apply(&table.name, err))?;

        Ok(count)
    };

    match timeout(budget, work).await {
        Ok(result) => result,
        Err(_) => Err(Error::CopyTimeout(table.name.clone())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tuner_backs_off_when_slow() {
        let mut tuner = BatchTuner::new(1_000, Duration::from_millis(250));
        tuner.observe(Duration::from_millis(400));
        assert_eq!(tuner.size(), 500);
    }

    #[test]
    fn test_tuner_grows_when_fast() {
        let mut tuner = BatchTuner::new(1_000, Duration::from_millis(250));
        tuner.observe(Duration::from_millis(50));
        assert_eq!(tuner.size(), 2_000);
    }

    #[test]
    fn test_tuner_holds_steady_in_band() {
        let mut tuner = BatchTuner::new(1_000, Duration::from_millis(250));
        tuner.observe(Duration::from_millis(200));
        assert_eq!(tuner.size(), 1_000);
    }

    #[test]
    fn test_tuner_clamped() {
        let mut tuner = BatchTuner::new(MIN_BATCH, Duration::from_millis(250));
        tuner.observe(Duration::from_secs(10));
        assert_eq!(tuner.size(), MIN_BATCH);

        let mut tuner = BatchTuner::new(MAX_BATCH, Duration::from_millis(250));
        tuner.observe(Duration::from_millis(1));
        assert_eq!(tuner.size(), MAX_BATCH);
    }
}
