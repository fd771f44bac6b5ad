//! Change capture plumbing on the old database.
//!
//! One generic trigger function appends a jsonb image of every row
//! mutation to `change_log`, in the same transaction as the mutation.
//! Per-table triggers pass their key columns as trigger arguments, so
//! the function never needs per-table knowledge.

use tracing::{debug, info};

use crate::backend::Server;
use crate::util::escape_identifier;

use super::{table::TrackedTable, Error};

pub(crate) const CHANGE_LOG_DDL: &str = "\
CREATE TABLE IF NOT EXISTS change_log (
    id BIGSERIAL PRIMARY KEY,
    table_name TEXT NOT NULL,
    op TEXT NOT NULL CHECK (op IN ('I', 'U', 'D')),
    row_key JSONB NOT NULL,
    row_data JSONB,
    committed_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

pub(crate) const CAPTURE_FUNCTION_DDL: &str = "\
CREATE OR REPLACE FUNCTION switchover_change_capture() RETURNS TRIGGER AS $$
DECLARE
    image JSONB;
    key JSONB := '{}'::jsonb;
    col TEXT;
BEGIN
    IF TG_OP = 'DELETE' THEN
        image := to_jsonb(OLD);
    ELSE
        image := to_jsonb(NEW);
    END IF;

    FOREACH col IN ARRAY TG_ARGV LOOP
        key := key || jsonb_build_object(col, image -> col);
    END LOOP;

    INSERT INTO change_log (table_name, op, row_key, row_data)
    VALUES (
        TG_TABLE_NAME,
        CASE TG_OP WHEN 'INSERT' THEN 'I' WHEN 'UPDATE' THEN 'U' ELSE 'D' END,
        key,
        CASE WHEN TG_OP = 'DELETE' THEN NULL ELSE image END
    );

    RETURN NULL;
END;
$$ LANGUAGE plpgsql";

/// Tables that belong to the switchover machinery itself and must
/// never be captured or copied. Engine cursors (`engine_state`) are
/// application state and do sync, so cycles resume on the new backend.
const BOOKKEEPING_TABLES: &[&str] = &[
    "change_log",
    "switchover_state",
    "switchover_nodes",
    "switchover_migrations",
    "switchover_sync_cursor",
];

fn quote(name: &str) -> String {
    format!("\"{}\"", escape_identifier(name))
}

pub(crate) fn trigger_name(table: &str) -> String {
    format!("zz_switchover_{}", table)
}

fn trigger_ddl(table: &TrackedTable) -> String {
    let args = table
        .key
        .iter()
        .map(|column| format!("'{}'", column.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TRIGGER {trigger} \
         AFTER INSERT OR UPDATE OR DELETE ON {table} \
         FOR EACH ROW EXECUTE FUNCTION switchover_change_capture({args})",
        trigger = quote(&trigger_name(&table.name)),
        table = quote(&table.name),
        args = args,
    )
}

/// Discover the tables to track: the configured list, or every table
/// in the public schema minus our own bookkeeping.
pub(crate) async fn discover_tables(server: &Server) -> Result<Vec<TrackedTable>, Error> {
    let configured = crate::config::config().switchover.tables.clone();

    let names: Vec<String> = if configured.is_empty() {
        server
            .query(
                "SELECT tablename FROM pg_tables \
                 WHERE schemaname = 'public' AND tablename != ALL($1) \
                 ORDER BY tablename",
                &[&BOOKKEEPING_TABLES
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()],
            )
            .await?
            .iter()
            .map(|row| row.get(0))
            .collect()
    } else {
        configured
    };

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        tables.push(introspect(server, &name).await?);
    }

    Ok(tables)
}

async fn introspect(server: &Server, name: &str) -> Result<TrackedTable, Error> {
    let columns: Vec<String> = server
        .query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 \
             ORDER BY ordinal_position",
            &[&name],
        )
        .await?
        .iter()
        .map(|row| row.get(0))
        .collect();

    let key: Vec<String> = server
        .query(
            "SELECT a.attname \
             FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = ($1::text)::regclass AND i.indisprimary \
             ORDER BY array_position(i.indkey, a.attnum)",
            &[&format!("public.{}", quote(name))],
        )
        .await?
        .iter()
        .map(|row| row.get(0))
        .collect();

    if key.is_empty() {
        return Err(Error::NoPrimaryKey(name.to_string()));
    }

    Ok(TrackedTable {
        name: name.to_string(),
        columns,
        key,
    })
}

/// Install the change log and per-table capture triggers.
/// Idempotent: re-attaching after an abort reuses what's in place.
pub(crate) async fn attach(server: &Server, tables: &[TrackedTable]) -> Result<(), Error> {
    server.batch(CHANGE_LOG_DDL).await?;
    server.batch(CAPTURE_FUNCTION_DDL).await?;

    for table in tables {
        let drop = format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote(&trigger_name(&table.name)),
            quote(&table.name),
        );
        server.batch(&drop).await?;
        server.batch(&trigger_ddl(table)).await?;
        debug!("capture trigger installed on \"{}\"", table.name);
    }

    info!("change capture attached to {} table(s)", tables.len());

    Ok(())
}

/// Tear down triggers, the capture function and the change log.
/// Triggers are discovered from the catalog rather than taken on
/// trust, so a fresh process can clean up after an old one.
pub(crate) async fn detach(server: &Server) -> Result<(), Error> {
    let triggers = server
        .query(
            "SELECT c.relname, t.tgname \
             FROM pg_trigger t \
             JOIN pg_class c ON c.oid = t.tgrelid \
             WHERE t.tgname LIKE 'zz_switchover_%' AND NOT t.tgisinternal",
            &[],
        )
        .await?;

    for row in &triggers {
        let table: String = row.get(0);
        let trigger: String = row.get(1);
        let drop = format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote(&trigger),
            quote(&table),
        );
        server.batch(&drop).await?;
    }

    server
        .batch("DROP FUNCTION IF EXISTS switchover_change_capture()")
        .await?;
    server.batch("DROP TABLE IF EXISTS change_log").await?;

    info!("change capture detached ({} trigger(s))", triggers.len());

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_trigger_name() {
        assert_eq!(trigger_name("alerts"), "zz_switchover_alerts");
    }

    #[test]
    fn test_trigger_ddl_passes_key_columns() {
        let table = TrackedTable {
            name: "memberships".into(),
            columns: vec!["user_id".into(), "team_id".into(), "role".into()],
            key: vec!["user_id".into(), "team_id".into()],
        };
        let ddl = trigger_ddl(&table);

        assert!(ddl.contains("CREATE TRIGGER \"zz_switchover_memberships\""));
        assert!(ddl.contains("AFTER INSERT OR UPDATE OR DELETE ON \"memberships\""));
        assert!(ddl.contains("switchover_change_capture('user_id', 'team_id')"));
    }

    #[test]
    fn test_change_log_ddl_shape() {
        assert!(CHANGE_LOG_DDL.contains("id BIGSERIAL PRIMARY KEY"));
        assert!(CHANGE_LOG_DDL.contains("op TEXT NOT NULL CHECK (op IN ('I', 'U', 'D'))"));
        assert!(CHANGE_LOG_DDL.contains("committed_at TIMESTAMPTZ NOT NULL DEFAULT now()"));
    }
}
