//! PostgreSQL session over the blocking `postgres` client.

use super::{render_insert, ColumnMeta, Database, DbError, QualifiedName, SequenceSync};
use crate::dataset::Value;
use postgres::{Client, NoTls};
use tracing::debug;

/// Strip a `+driver` suffix from a URL scheme (`postgresql+psycopg://` ->
/// `postgresql://`). Key/value DSNs are returned unchanged.
pub fn normalize_dsn(dsn: &str) -> String {
    let dsn = dsn.trim();
    let Some(scheme_end) = dsn.find("://") else {
        return dsn.to_string();
    };
    let scheme = &dsn[..scheme_end];
    match scheme.find('+') {
        Some(plus) => format!("{}{}", &scheme[..plus], &dsn[scheme_end..]),
        None => dsn.to_string(),
    }
}

impl From<postgres::Error> for DbError {
    fn from(err: postgres::Error) -> Self {
        let code = err.code().map(|c| c.code().to_string());
        let message = match err.as_db_error() {
            Some(db) => {
                let mut msg = db.message().to_string();
                if let Some(detail) = db.detail() {
                    msg.push_str(": ");
                    msg.push_str(detail);
                }
                if let Some(hint) = db.hint() {
                    msg.push_str(" (hint: ");
                    msg.push_str(hint);
                    msg.push(')');
                }
                msg
            }
            None => err.to_string(),
        };
        DbError { code, message }
    }
}

/// A single PostgreSQL connection.
///
/// Statements go through the simple query protocol, so `%` and `$n` inside
/// script text are sent verbatim.
pub struct PgDatabase {
    client: Client,
}

impl PgDatabase {
    pub fn connect(dsn: &str) -> Result<Self, DbError> {
        let dsn = normalize_dsn(dsn);
        let client = Client::connect(&dsn, NoTls)?;
        debug!("connected to PostgreSQL");
        Ok(Self { client })
    }
}

impl Database for PgDatabase {
    fn execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.client.batch_execute(sql)?;
        Ok(())
    }

    fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool, DbError> {
        let row = self.client.query_one(
            "SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema::text = $1 AND table_name::text = $2
            )",
            &[&schema, &table],
        )?;
        Ok(row.get(0))
    }

    fn columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnMeta>, DbError> {
        let rows = self.client.query(
            "SELECT column_name::text,
                    is_nullable::text = 'YES',
                    column_default IS NOT NULL OR is_generated::text = 'ALWAYS',
                    is_identity::text = 'YES'
             FROM information_schema.columns
             WHERE table_schema::text = $1 AND table_name::text = $2
             ORDER BY ordinal_position",
            &[&schema, &table],
        )?;
        Ok(rows
            .iter()
            .map(|row| ColumnMeta {
                name: row.get(0),
                is_nullable: row.get(1),
                has_default: row.get(2),
                is_identity: row.get(3),
            })
            .collect())
    }

    fn base_tables(&mut self, schema: &str) -> Result<Vec<QualifiedName>, DbError> {
        let rows = self.client.query(
            "SELECT table_name::text
             FROM information_schema.tables
             WHERE table_schema::text = $1 AND table_type::text = 'BASE TABLE'
             ORDER BY table_name",
            &[&schema],
        )?;
        Ok(rows
            .iter()
            .map(|row| QualifiedName::new(schema, row.get::<_, String>(0)))
            .collect())
    }

    fn insert_rows(
        &mut self,
        target: &QualifiedName,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, DbError> {
        let sql = render_insert(target, columns, rows);
        if sql.is_empty() {
            return Ok(0);
        }
        Ok(self.client.execute(sql.as_str(), &[])?)
    }

    fn sync_sequence(
        &mut self,
        target: &QualifiedName,
        column: &str,
    ) -> Result<SequenceSync, DbError> {
        let has_column = self.client.query_opt(
            "SELECT 1 FROM information_schema.columns
             WHERE table_schema::text = $1 AND table_name::text = $2
               AND column_name::text = $3",
            &[&target.schema, &target.table, &column],
        )?;
        if has_column.is_none() {
            return Ok(SequenceSync::NoColumn);
        }

        let quoted = target.quoted();
        let row = self.client.query_one(
            "SELECT pg_get_serial_sequence($1, $2)",
            &[&quoted, &column],
        )?;
        let Some(sequence) = row.get::<_, Option<String>>(0) else {
            return Ok(SequenceSync::NoSequence);
        };

        let row = self.client.query_one(
            format!(
                "SELECT MAX({})::bigint FROM {}",
                super::quote_ident(column),
                quoted
            )
            .as_str(),
            &[],
        )?;
        let max: Option<i64> = row.get(0);

        match max {
            Some(max) => {
                self.client.query_one(
                    "SELECT setval($1::text::regclass, $2, true)",
                    &[&sequence, &max],
                )?;
            }
            None => {
                self.client.query_one(
                    "SELECT setval($1::text::regclass, 1, false)",
                    &[&sequence],
                )?;
            }
        }
        debug!(table = %target, sequence = %sequence, ?max, "sequence synced");
        Ok(SequenceSync::Reset { max })
    }
}
