//! Database access layer.
//!
//! Everything the runner and loader need from a database goes through the
//! [`Database`] trait: statement execution, transactions and savepoints,
//! catalog introspection, batched inserts and sequence resync. One session is
//! opened by the caller and passed by `&mut` reference to every component.
//!
//! [`PgDatabase`] is the PostgreSQL implementation.

mod insert;
mod pg;

pub use pg::{normalize_dsn, PgDatabase};
pub use insert::{render_insert, render_value};

use crate::dataset::Value;
use std::fmt;

/// SQLSTATE raised when the role lacks a privilege (e.g. on a sequence)
pub const INSUFFICIENT_PRIVILEGE: &str = "42501";

/// A database error with its SQLSTATE, when the server provided one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub code: Option<String>,
    pub message: String,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code() == Some(code)
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (SQLSTATE {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DbError {}

/// Quote an identifier with double quotes, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    pub schema: String,
    pub table: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `"schema"."table"`, safe to splice into SQL
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Live metadata for one destination column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub is_nullable: bool,
    pub has_default: bool,
    pub is_identity: bool,
}

impl ColumnMeta {
    /// A value must be supplied for this column on insert.
    pub fn is_required(&self) -> bool {
        !self.is_nullable && !self.has_default && !self.is_identity
    }
}

/// Outcome of aligning a column's sequence with the data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceSync {
    /// The table has no such column
    NoColumn,
    /// The column is not backed by a sequence
    NoSequence,
    /// The sequence now continues after `max` (restarts at 1 when `None`)
    Reset { max: Option<i64> },
}

/// A single database session.
///
/// Transaction control and schema statements have default implementations
/// that go through [`Database::execute`].
pub trait Database {
    /// Execute one statement, discarding any rows.
    fn execute(&mut self, sql: &str) -> Result<(), DbError>;

    fn begin(&mut self) -> Result<(), DbError> {
        self.execute("BEGIN")
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.execute("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.execute("ROLLBACK")
    }

    fn savepoint(&mut self, name: &str) -> Result<(), DbError> {
        self.execute(&format!("SAVEPOINT {}", quote_ident(name)))
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), DbError> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)))
    }

    fn release_savepoint(&mut self, name: &str) -> Result<(), DbError> {
        self.execute(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))
    }

    /// True when the driver treats `%` as a parameter marker in raw SQL.
    fn uses_format_placeholders(&self) -> bool {
        false
    }

    fn create_schema(&mut self, schema: &str) -> Result<(), DbError> {
        self.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
    }

    fn drop_schema(&mut self, schema: &str) -> Result<(), DbError> {
        self.execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema)))
    }

    /// Truncate all `tables` in one statement, restarting identities.
    fn truncate_tables(&mut self, tables: &[QualifiedName]) -> Result<(), DbError> {
        if tables.is_empty() {
            return Ok(());
        }
        let list: Vec<String> = tables.iter().map(QualifiedName::quoted).collect();
        self.execute(&format!(
            "TRUNCATE TABLE {} RESTART IDENTITY CASCADE",
            list.join(", ")
        ))
    }

    fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool, DbError>;

    /// Columns of `schema.table` in ordinal order; empty when the table is absent.
    fn columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnMeta>, DbError>;

    /// Base tables (not views) in `schema`, ordered by name.
    fn base_tables(&mut self, schema: &str) -> Result<Vec<QualifiedName>, DbError>;

    /// Append `rows` (laid out as `columns`) to `target`; returns rows written.
    fn insert_rows(
        &mut self,
        target: &QualifiedName,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, DbError>;

    /// Move the sequence behind `target.column` to the column's current maximum.
    fn sync_sequence(
        &mut self,
        target: &QualifiedName,
        column: &str,
    ) -> Result<SequenceSync, DbError>;
}
