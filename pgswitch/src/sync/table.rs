//! Tracked tables.
//!
//! Column and key layout is introspected once at attach; every apply
//! statement is generated from it. Row images travel as jsonb, so one
//! set of statement shapes serves every table.

use crate::util::escape_identifier;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedTable {
    pub name: String,
    pub columns: Vec<String>,
    pub key: Vec<String>,
}

fn quote(name: &str) -> String {
    format!("\"{}\"", escape_identifier(name))
}

impl TrackedTable {
    /// Non-key columns, the ones an upsert overwrites.
    fn data_columns(&self) -> Vec<&String> {
        self.columns
            .iter()
            .filter(|column| !self.key.contains(column))
            .collect()
    }

    fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn key_list(&self) -> String {
        self.key
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Batch upsert from a jsonb array of row images.
    /// Insert-or-ignore and update-by-key share this shape; replaying
    /// any suffix of the change log converges on the same state.
    pub fn upsert_sql(&self, ignore_duplicates: bool) -> String {
        let table = quote(&self.name);
        let action = if ignore_duplicates || self.data_columns().is_empty() {
            "DO NOTHING".to_string()
        } else {
            let assignments = self
                .data_columns()
                .iter()
                .map(|c| format!("{} = EXCLUDED.{}", quote(c), quote(c)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("DO UPDATE SET {}", assignments)
        };

        format!(
            "INSERT INTO {table} ({columns}) \
             SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1) \
             ON CONFLICT ({key}) {action}",
            table = table,
            columns = self.column_list(),
            key = self.key_list(),
            action = action,
        )
    }

    /// Delete-by-key from a jsonb key image. Zero rows is not an
    /// error: the delete may replay.
    pub fn delete_sql(&self) -> String {
        let table = quote(&self.name);
        let clauses = self
            .key
            .iter()
            .map(|c| format!("{}.{} = r.{}", table, quote(c), quote(c)))
            .collect::<Vec<_>>()
            .join(" AND ");

        format!(
            "DELETE FROM {table} USING jsonb_populate_record(NULL::{table}, $1) AS r \
             WHERE {clauses}",
            table = table,
            clauses = clauses,
        )
    }

    /// Key-ordered page of full row images.
    pub fn select_batch_sql(&self) -> String {
        let order = self
            .key
            .iter()
            .map(|c| format!("src.{}", quote(c)))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "SELECT to_jsonb(src) FROM {} AS src ORDER BY {} LIMIT $1 OFFSET $2",
            quote(&self.name),
            order,
        )
    }

    pub fn count_sql(&self) -> String {
        format!("SELECT count(*) FROM {}", quote(&self.name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> TrackedTable {
        TrackedTable {
            name: "alerts".into(),
            columns: vec![
                "id".into(),
                "service_id".into(),
                "status".into(),
                "created_at".into(),
            ],
            key: vec!["id".into()],
        }
    }

    #[test]
    fn test_upsert_updates_data_columns() {
        let sql = table().upsert_sql(false);
        assert!(sql.starts_with(
            "INSERT INTO \"alerts\" (\"id\", \"service_id\", \"status\", \"created_at\")"
        ));
        assert!(sql.contains("jsonb_populate_recordset(NULL::\"alerts\", $1)"));
        assert!(sql.contains("ON CONFLICT (\"id\") DO UPDATE SET"));
        assert!(sql.contains("\"service_id\" = EXCLUDED.\"service_id\""));
        assert!(!sql.contains("\"id\" = EXCLUDED.\"id\""));
    }

    #[test]
    fn test_insert_ignores_duplicates() {
        let sql = table().upsert_sql(true);
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO NOTHING"));
    }

    #[test]
    fn test_all_key_table_upserts_to_nothing() {
        let table = TrackedTable {
            name: "memberships".into(),
            columns: vec!["user_id".into(), "team_id".into()],
            key: vec!["user_id".into(), "team_id".into()],
        };
        assert!(table.upsert_sql(false).ends_with("DO NOTHING"));
    }

    #[test]
    fn test_delete_matches_every_key_column() {
        let table = TrackedTable {
            name: "memberships".into(),
            columns: vec!["user_id".into(), "team_id".into()],
            key: vec!["user_id".into(), "team_id".into()],
        };
        let sql = table.delete_sql();
        assert!(sql.contains("\"memberships\".\"user_id\" = r.\"user_id\""));
        assert!(sql.contains(" AND \"memberships\".\"team_id\" = r.\"team_id\""));
    }

    #[test]
    fn test_select_batch_ordered_by_key() {
        let sql = table().select_batch_sql();
        assert_eq!(
            sql,
            "SELECT to_jsonb(src) FROM \"alerts\" AS src ORDER BY src.\"id\" LIMIT $1 OFFSET $2"
        );
    }
}
