//! Change-log tail.
//!
//! Applies captured mutations to the next database in strictly
//! increasing id order, at most `apply_batch_size` rows per
//! transaction. The cursor advances in the same transaction as the
//! rows it covers, so a crash never loses or doubles progress.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::Server;

use super::{table::TrackedTable, Error};

/// Apply one batch of change rows past the cursor.
/// Returns the new cursor position and the number of rows applied,
/// or None when there was nothing to apply.
pub(crate) async fn tail_step(
    old: &Server,
    next: &mut Server,
    tables: &HashMap<String, TrackedTable>,
    cursor: i64,
    limit: i64,
) -> Result<Option<(i64, usize)>, Error> {
    let rows = old
        .query(
            "SELECT id, table_name, op, row_key, row_data FROM change_log \
             WHERE id > $1 ORDER BY id LIMIT $2",
            &[&cursor, &limit],
        )
        .await?;

    if rows.is_empty() {
        return Ok(None);
    }

    let tx = next.transaction().await?;
    let mut last_id = cursor;

    for row in &rows {
        let id: i64 = row.get(0);
        let table_name: String = row.get(1);
        let op: String = row.get(2);
        let row_key: Value = row.get(3);
        let row_data: Option<Value> = row.get(4);

        let Some(table) = tables.get(&table_name) else {
            // A trigger left over from a previous run on a table we
            // no longer track.
            warn!("change row {} for untracked table \"{}\"", id, table_name);
            last_id = id;
            continue;
        };

        let result = match op.as_str() {
            "I" => {
                let image = row_data.unwrap_or(Value::Null);
                tx.execute(
                    &table.upsert_sql(true),
                    &[&Value::Array(vec![image])],
                )
                .await
            }
            "U" => {
                let image = row_data.unwrap_or(Value::Null);
                tx.execute(
                    &table.upsert_sql(false),
                    &[&Value::Array(vec![image])],
                )
                .await
            }
            "D" => tx.execute(&table.delete_sql(), &[&row_key]).await,
            other => {
                warn!("change row {} carries unknown op \"{}\"", id, other);
                last_id = id;
                continue;
            }
        };

        if let Err(err) = result {
            return Err(Error::apply(&table_name, err.into()));
        }

        last_id = id;
    }

    tx.execute(
        "UPDATE switchover_sync_cursor \
         SET last_change_id = $1, last_applied_at = now() \
         WHERE singleton AND last_change_id < $1",
        &[&last_id],
    )
    .await
    .map_err(crate::backend::Error::from)?;

    tx.commit().await.map_err(crate::backend::Error::from)?;

    debug!("applied {} change row(s), cursor={}", rows.len(), last_id);

    Ok(Some((last_id, rows.len())))
}

/// Replication lag in change-log rows.
pub(crate) async fn lag(old: &Server, cursor: i64) -> Result<i64, Error> {
    let row = old
        .query_one("SELECT COALESCE(max(id), 0) FROM change_log", &[])
        .await?;
    let max_id: i64 = row.get(0);

    Ok((max_id - cursor).max(0))
}
