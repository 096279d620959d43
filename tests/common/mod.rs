//! In-memory `Database` used by the integration tests.
//!
//! Understands just enough SQL for the fixtures: transaction control,
//! savepoints, `CREATE/DROP SCHEMA`, a simple `CREATE TABLE`, and `TRUNCATE`.
//! Anything else succeeds as a no-op. Like PostgreSQL, a failed statement
//! inside a transaction leaves it aborted (SQLSTATE 25P02) until rolled back.

#![allow(dead_code)]

use sql_seed::db::{ColumnMeta, Database, DbError, QualifiedName, SequenceSync};
use sql_seed::dataset::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

pub const IN_FAILED_TRANSACTION: &str = "25P02";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FakeTable {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<BTreeMap<String, Value>>,
}

impl FakeTable {
    /// Values of `column` across all rows, `Null` where unset
    pub fn column_values(&self, column: &str) -> Vec<Value> {
        self.rows
            .iter()
            .map(|r| r.get(column).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub schemas: BTreeSet<String>,
    pub tables: BTreeMap<QualifiedName, FakeTable>,
    /// Statements that reached the (fake) server and were kept
    pub applied: Vec<String>,
    /// Sequence positions set by `sync_sequence`
    pub sequences: BTreeMap<String, Option<i64>>,
}

#[derive(Debug, Default)]
pub struct FakeDb {
    pub state: State,
    tx: Option<State>,
    savepoints: Vec<(String, State)>,
    aborted: bool,
    /// Every statement passed to `execute`, including failed ones
    pub log: Vec<String>,
    /// Statements containing the pattern fail with the code, transaction
    /// control included
    pub fail_on: Vec<(String, String)>,
    /// Inserts into these qualified names fail
    pub fail_inserts: BTreeSet<String>,
    pub sequence_error: Option<DbError>,
    pub format_placeholders: bool,
    pub insert_batches: Vec<(String, usize)>,
}

impl FakeDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, pattern: &str, code: &str) -> Self {
        self.fail_on.push((pattern.to_string(), code.to_string()));
        self
    }

    /// Create a schema and table directly, outside any transaction.
    pub fn with_table(mut self, schema: &str, table: &str, columns: Vec<ColumnMeta>) -> Self {
        self.state.schemas.insert(schema.to_string());
        self.state.tables.insert(
            QualifiedName::new(schema, table),
            FakeTable {
                columns,
                rows: Vec::new(),
            },
        );
        self
    }

    pub fn table(&self, schema: &str, table: &str) -> Option<&FakeTable> {
        self.state.tables.get(&QualifiedName::new(schema, table))
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// True when `execute` saw a statement starting with `prefix`
    pub fn logged(&self, prefix: &str) -> bool {
        self.log.iter().any(|s| s.starts_with(prefix))
    }

    fn fail(&mut self, code: &str, message: impl Into<String>) -> DbError {
        if self.tx.is_some() {
            self.aborted = true;
        }
        DbError::with_code(code, message)
    }

    fn check_aborted(&self) -> Result<(), DbError> {
        if self.aborted {
            return Err(DbError::with_code(
                IN_FAILED_TRANSACTION,
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        Ok(())
    }

    fn apply(&mut self, sql: &str) -> Result<(), DbError> {
        let upper = sql.trim().to_uppercase();

        if let Some(rest) = strip_prefix_ci(sql, "CREATE SCHEMA IF NOT EXISTS ")
            .or_else(|| strip_prefix_ci(sql, "CREATE SCHEMA "))
        {
            self.state.schemas.insert(unquote(first_word(rest)));
        } else if let Some(rest) = strip_prefix_ci(sql, "DROP SCHEMA IF EXISTS ") {
            let schema = unquote(first_word(rest));
            self.state.schemas.remove(&schema);
            self.state.tables.retain(|name, _| name.schema != schema);
        } else if let Some(rest) = strip_prefix_ci(sql, "TRUNCATE TABLE ") {
            let list = rest.split(" RESTART").next().unwrap_or(rest);
            for name in list.split(',') {
                let name = parse_qualified(name.trim());
                match self.state.tables.get_mut(&name) {
                    Some(table) => table.rows.clear(),
                    None => return Err(self.fail("42P01", format!("relation {} does not exist", name))),
                }
            }
        } else if upper.starts_with("CREATE TABLE") {
            self.create_table(sql)?;
        }

        self.state.applied.push(sql.to_string());
        Ok(())
    }

    fn create_table(&mut self, sql: &str) -> Result<(), DbError> {
        let (head, body) = sql
            .split_once('(')
            .ok_or_else(|| DbError::with_code("42601", "syntax error"))?;
        let name = head.trim()["CREATE TABLE".len()..]
            .trim()
            .trim_start_matches("IF NOT EXISTS")
            .trim();
        let name = parse_qualified(name);
        if !self.state.schemas.contains(&name.schema) {
            return Err(self.fail("3F000", format!("schema \"{}\" does not exist", name.schema)));
        }
        if self.state.tables.contains_key(&name) {
            return Err(self.fail("42P07", format!("relation \"{}\" already exists", name.table)));
        }

        let body = body.trim_end().trim_end_matches(';').trim_end();
        let body = body.strip_suffix(')').unwrap_or(body);
        let columns = split_top_level(body)
            .into_iter()
            .filter_map(|def| {
                let def = def.trim();
                let upper = def.to_uppercase();
                if upper.is_empty()
                    || upper.starts_with("PRIMARY KEY")
                    || upper.starts_with("CONSTRAINT")
                    || upper.starts_with("FOREIGN KEY")
                    || upper.starts_with("UNIQUE")
                {
                    return None;
                }
                Some(ColumnMeta {
                    name: unquote(first_word(def)),
                    is_nullable: !(upper.contains("NOT NULL") || upper.contains("PRIMARY KEY")),
                    has_default: upper.contains("DEFAULT") || upper.contains("SERIAL"),
                    is_identity: upper.contains("IDENTITY"),
                })
            })
            .collect();

        self.state.tables.insert(
            name,
            FakeTable {
                columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }
}

impl Database for FakeDb {
    fn execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.log.push(sql.to_string());
        let upper = sql.trim().to_uppercase();

        if let Some((_, code)) = self
            .fail_on
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .cloned()
        {
            return Err(self.fail(&code, format!("injected failure: {}", sql)));
        }

        if upper == "BEGIN" {
            self.tx = Some(self.state.clone());
            self.aborted = false;
            return Ok(());
        }
        if upper == "COMMIT" {
            if let Some(snapshot) = self.tx.take() {
                if self.aborted {
                    // COMMIT of an aborted transaction rolls back
                    self.state = snapshot;
                }
            }
            self.savepoints.clear();
            self.aborted = false;
            return Ok(());
        }
        if let Some(name) = upper.strip_prefix("ROLLBACK TO SAVEPOINT ") {
            let name = unquote(name).to_lowercase();
            let pos = self
                .savepoints
                .iter()
                .rposition(|(n, _)| *n == name)
                .ok_or_else(|| DbError::with_code("3B001", "savepoint does not exist"))?;
            self.state = self.savepoints[pos].1.clone();
            self.savepoints.truncate(pos + 1);
            self.aborted = false;
            return Ok(());
        }
        if upper == "ROLLBACK" {
            if let Some(snapshot) = self.tx.take() {
                self.state = snapshot;
            }
            self.savepoints.clear();
            self.aborted = false;
            return Ok(());
        }
        if let Some(name) = upper.strip_prefix("SAVEPOINT ") {
            self.check_aborted()?;
            self.savepoints
                .push((unquote(name).to_lowercase(), self.state.clone()));
            return Ok(());
        }
        if let Some(name) = upper.strip_prefix("RELEASE SAVEPOINT ") {
            self.check_aborted()?;
            let name = unquote(name).to_lowercase();
            if let Some(pos) = self.savepoints.iter().rposition(|(n, _)| *n == name) {
                self.savepoints.truncate(pos);
            }
            return Ok(());
        }

        self.check_aborted()?;
        self.apply(sql)
    }

    fn uses_format_placeholders(&self) -> bool {
        self.format_placeholders
    }

    fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool, DbError> {
        self.check_aborted()?;
        Ok(self
            .state
            .tables
            .contains_key(&QualifiedName::new(schema, table)))
    }

    fn columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnMeta>, DbError> {
        self.check_aborted()?;
        Ok(self
            .state
            .tables
            .get(&QualifiedName::new(schema, table))
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    fn base_tables(&mut self, schema: &str) -> Result<Vec<QualifiedName>, DbError> {
        self.check_aborted()?;
        Ok(self
            .state
            .tables
            .keys()
            .filter(|name| name.schema == schema)
            .cloned()
            .collect())
    }

    fn insert_rows(
        &mut self,
        target: &QualifiedName,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, DbError> {
        self.check_aborted()?;
        if self.fail_inserts.contains(&target.to_string()) {
            return Err(self.fail("23505", format!("duplicate key in {}", target)));
        }
        let Some(table) = self.state.tables.get(target) else {
            return Err(self.fail("42P01", format!("relation {} does not exist", target)));
        };
        if let Some(unknown) = columns
            .iter()
            .find(|c| !table.columns.iter().any(|m| &m.name == *c))
        {
            let msg = format!("column \"{}\" does not exist", unknown);
            return Err(self.fail("42703", msg));
        }
        if let Some(required) = table
            .columns
            .iter()
            .find(|m| m.is_required() && !columns.contains(&m.name))
        {
            let msg = format!("null value in column \"{}\"", required.name);
            return Err(self.fail("23502", msg));
        }

        self.log.push(format!("INSERT INTO {}", target));
        self.insert_batches.push((target.to_string(), rows.len()));
        let table = self
            .state
            .tables
            .get_mut(target)
            .ok_or_else(|| DbError::new("table vanished"))?;
        for row in rows {
            table
                .rows
                .push(columns.iter().cloned().zip(row.iter().cloned()).collect());
        }
        Ok(rows.len() as u64)
    }

    fn sync_sequence(
        &mut self,
        target: &QualifiedName,
        column: &str,
    ) -> Result<SequenceSync, DbError> {
        if let Some(err) = self.sequence_error.clone() {
            return Err(err);
        }
        let Some(table) = self.state.tables.get(target) else {
            return Ok(SequenceSync::NoColumn);
        };
        let Some(meta) = table.columns.iter().find(|c| c.name == column) else {
            return Ok(SequenceSync::NoColumn);
        };
        if !(meta.is_identity || meta.has_default) {
            return Ok(SequenceSync::NoSequence);
        }
        let max = table
            .column_values(column)
            .iter()
            .filter_map(as_id)
            .max();
        self.state
            .sequences
            .insert(format!("{}.{}", target, column), max);
        Ok(SequenceSync::Reset { max })
    }
}

fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn col(name: &str, nullable: bool) -> ColumnMeta {
    ColumnMeta {
        name: name.to_string(),
        is_nullable: nullable,
        has_default: false,
        is_identity: false,
    }
}

pub fn identity(name: &str) -> ColumnMeta {
    ColumnMeta {
        name: name.to_string(),
        is_nullable: false,
        has_default: false,
        is_identity: true,
    }
}

/// Write `files` (name, contents) into `dir`.
pub fn write_scripts(dir: &Path, files: &[(&str, &str)]) {
    for (name, contents) in files {
        fs::write(dir.join(name), contents).unwrap();
    }
}

fn strip_prefix_ci<'a>(sql: &'a str, prefix: &str) -> Option<&'a str> {
    let sql = sql.trim_start();
    if sql.len() >= prefix.len() && sql[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&sql[prefix.len()..])
    } else {
        None
    }
}

fn first_word(s: &str) -> &str {
    s.trim()
        .split(|c: char| c.is_whitespace() || c == ';')
        .next()
        .unwrap_or("")
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('"').replace("\"\"", "\"")
}

fn parse_qualified(name: &str) -> QualifiedName {
    let name = first_word(name);
    match name.split_once("\".\"") {
        Some((schema, table)) => QualifiedName::new(unquote(schema), unquote(table)),
        None => match name.split_once('.') {
            Some((schema, table)) => QualifiedName::new(unquote(schema), unquote(table)),
            None => QualifiedName::new("public", unquote(name)),
        },
    }
}

fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}
