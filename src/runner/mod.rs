//! Script runner: executes named `.sql` files against a database session.
//!
//! Each file runs in its own transaction. Under [`ErrorPolicy::Abort`] the
//! first failing statement rolls the file back and stops the run. Under
//! [`ErrorPolicy::Continue`] every statement is wrapped in a savepoint so a
//! failure only discards that statement.

use crate::db::{Database, DbError};
use crate::splitter::{excerpt, split_statements, Statement};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Statement excerpt length in log lines
const LOG_EXCERPT_CHARS: usize = 2000;
/// Statement excerpt length carried in [`ScriptError::Statement`]
const ERROR_EXCERPT_CHARS: usize = 200;

/// What to do when a statement fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Roll the file back and fail the run
    #[default]
    Abort,
    /// Discard the failing statement and keep going
    Continue,
}

impl std::str::FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(ErrorPolicy::Abort),
            "continue" => Ok(ErrorPolicy::Continue),
            _ => Err(format!(
                "Unknown error policy: {}. Valid options: abort, continue",
                s
            )),
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Abort => write!(f, "abort"),
            ErrorPolicy::Continue => write!(f, "continue"),
        }
    }
}

/// Errors that stop a script run
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("SQL directory not found: {}", .0.display())]
    SqlDirNotFound(PathBuf),

    #[error("script not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{file}: statement #{index} (line {line}) failed: {source}\n{excerpt}")]
    Statement {
        file: String,
        /// 1-based position of the statement in the file
        index: usize,
        line: usize,
        excerpt: String,
        #[source]
        source: DbError,
    },

    #[error("{file}: transaction control failed: {source}")]
    Transaction {
        file: String,
        #[source]
        source: DbError,
    },

    #[error("deadline exceeded while running {file}")]
    DeadlineExceeded { file: String },
}

impl ScriptError {
    /// SQLSTATE of the underlying database error, if any
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            ScriptError::Statement { source, .. } | ScriptError::Transaction { source, .. } => {
                source.code()
            }
            _ => None,
        }
    }
}

/// Trim and uppercase SQLSTATE codes, dropping blanks.
pub fn normalize_sqlstates<I, S>(codes: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    codes
        .into_iter()
        .map(|code| code.as_ref().trim().to_uppercase())
        .filter(|code| !code.is_empty())
        .collect()
}

/// Options shared by every file of a run
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    pub policy: ErrorPolicy,
    /// Missing files are reported instead of failing the run
    pub skip_missing: bool,
    /// SQLSTATEs treated as success
    pub ignore_codes: BTreeSet<String>,
    /// Checked between statements
    pub deadline: Option<Instant>,
}

/// Per-file outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub file: String,
    pub executed: usize,
    /// psql meta-commands that were not sent
    pub skipped: usize,
    /// Failed statements rolled back under the continue policy
    pub failed: usize,
    /// Failed statements whose SQLSTATE was in the ignore set
    pub ignored: usize,
}

/// Outcome of a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub files: Vec<FileReport>,
    /// Listed files that did not exist (only with `skip_missing`)
    pub missing: Vec<String>,
}

impl RunReport {
    pub fn executed(&self) -> usize {
        self.files.iter().map(|f| f.executed).sum()
    }

    pub fn failed(&self) -> usize {
        self.files.iter().map(|f| f.failed).sum()
    }
}

/// Runs an ordered list of script files from one directory.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    sql_dir: PathBuf,
    files: Vec<String>,
    options: RunnerOptions,
}

impl ScriptRunner {
    pub fn new<I, S>(sql_dir: impl Into<PathBuf>, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sql_dir: sql_dir.into(),
            files: files.into_iter().map(Into::into).collect(),
            options: RunnerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.options.policy = policy;
        self
    }

    /// Execute every listed file in order.
    pub fn run(&self, db: &mut dyn Database) -> Result<RunReport, ScriptError> {
        if !self.sql_dir.is_dir() {
            return Err(ScriptError::SqlDirNotFound(self.sql_dir.clone()));
        }

        let mut report = RunReport::default();
        for name in &self.files {
            let path = self.sql_dir.join(name);
            if !path.is_file() {
                if self.options.skip_missing {
                    warn!(file = %name, "script not found, skipping");
                    report.missing.push(name.clone());
                    continue;
                }
                return Err(ScriptError::MissingFile(path));
            }

            let file_report = self.run_file(db, name, &path)?;
            info!(
                file = %name,
                executed = file_report.executed,
                failed = file_report.failed,
                ignored = file_report.ignored,
                "script finished"
            );
            report.files.push(file_report);
        }
        Ok(report)
    }

    fn run_file(
        &self,
        db: &mut dyn Database,
        name: &str,
        path: &Path,
    ) -> Result<FileReport, ScriptError> {
        let text = fs::read_to_string(path).map_err(|source| ScriptError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let statements = split_statements(&text);
        let mut report = FileReport {
            file: name.to_string(),
            ..FileReport::default()
        };
        if statements.is_empty() {
            info!(file = %name, "script has no statements, skipping");
            return Ok(report);
        }
        debug!(file = %name, statements = statements.len(), "running script");

        db.begin().map_err(|source| ScriptError::Transaction {
            file: name.to_string(),
            source,
        })?;

        // every failure past BEGIN leaves the session outside a transaction
        let outcome = self
            .run_statements(db, name, &statements, &mut report)
            .and_then(|()| {
                db.commit().map_err(|source| ScriptError::Transaction {
                    file: name.to_string(),
                    source,
                })
            });
        if let Err(err) = outcome {
            rollback_quietly(db, name);
            return Err(err);
        }
        Ok(report)
    }

    /// Execute `statements` inside the file transaction opened by the caller.
    fn run_statements(
        &self,
        db: &mut dyn Database,
        name: &str,
        statements: &[Statement],
        report: &mut FileReport,
    ) -> Result<(), ScriptError> {
        let tx_err = |source| ScriptError::Transaction {
            file: name.to_string(),
            source,
        };

        // PostgreSQL aborts the transaction on any error, so ignorable codes
        // need a savepoint to recover from as well.
        let guarded =
            self.options.policy == ErrorPolicy::Continue || !self.options.ignore_codes.is_empty();

        for (i, stmt) in statements.iter().enumerate() {
            let index = i + 1;

            if self.deadline_passed() {
                error!(file = %name, statement = index, "deadline exceeded, rolling back");
                return Err(ScriptError::DeadlineExceeded {
                    file: name.to_string(),
                });
            }

            if stmt.is_meta_command() {
                warn!(
                    file = %name,
                    line = stmt.start_line,
                    command = %stmt.excerpt(80),
                    "skipping psql meta-command"
                );
                report.skipped += 1;
                continue;
            }

            let sql = if db.uses_format_placeholders() {
                stmt.sql.replace('%', "%%")
            } else {
                stmt.sql.clone()
            };

            if !guarded {
                if let Err(err) = db.execute(&sql) {
                    log_failure(name, index, stmt, &err);
                    return Err(statement_error(name, index, stmt, err));
                }
                report.executed += 1;
                continue;
            }

            let savepoint = format!("sp_{}", index);
            db.savepoint(&savepoint).map_err(tx_err)?;
            match db.execute(&sql) {
                Ok(()) => {
                    db.release_savepoint(&savepoint).map_err(tx_err)?;
                    report.executed += 1;
                }
                Err(err) => {
                    db.rollback_to_savepoint(&savepoint).map_err(tx_err)?;
                    db.release_savepoint(&savepoint).map_err(tx_err)?;

                    let ignorable = err
                        .code()
                        .is_some_and(|code| self.options.ignore_codes.contains(code));
                    if ignorable {
                        warn!(
                            file = %name,
                            statement = index,
                            line = stmt.start_line,
                            sqlstate = err.code().unwrap_or_default(),
                            "ignoring error: {}",
                            err.message
                        );
                        report.ignored += 1;
                        continue;
                    }

                    log_failure(name, index, stmt, &err);
                    if self.options.policy == ErrorPolicy::Abort {
                        return Err(statement_error(name, index, stmt, err));
                    }
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    fn deadline_passed(&self) -> bool {
        self.options
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

fn statement_error(file: &str, index: usize, stmt: &Statement, source: DbError) -> ScriptError {
    ScriptError::Statement {
        file: file.to_string(),
        index,
        line: stmt.start_line,
        excerpt: excerpt(&stmt.sql, ERROR_EXCERPT_CHARS),
        source,
    }
}

fn log_failure(file: &str, index: usize, stmt: &Statement, err: &DbError) {
    error!(
        file = %file,
        statement = index,
        line = stmt.start_line,
        sqlstate = err.code().unwrap_or("-"),
        sql = %stmt.excerpt(LOG_EXCERPT_CHARS),
        "statement failed: {}",
        err.message
    );
}

fn rollback_quietly(db: &mut dyn Database, file: &str) {
    if let Err(err) = db.rollback() {
        warn!(file = %file, "rollback failed: {}", err);
    }
}
