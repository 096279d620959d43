//! Load orchestrator.
//!
//! A load runs these phases strictly in order against one session:
//! 1. reset the target schemas ([`ResetMode`])
//! 2. pre-DDL scripts, when the reset requires them
//! 3. dataset inserts in plan order, then the fallback pass over unclaimed keys
//! 4. sequence resync for every loaded table
//! 5. post-DDL scripts, when DDL ran in this load
//! 6. optional `ANALYZE`
//!
//! Every table is written in its own transaction and committed before the
//! next one starts.

mod align;
mod reset;
mod sequence;

pub use align::{align_to_table, AlignError};
pub use reset::ResetMode;

use crate::dataset::{Dataset, DatasetMap};
use crate::db::{Database, DbError, QualifiedName};
use crate::plan::{LoadPlan, PlanError};
use crate::progress::row_progress;
use crate::runner::{ErrorPolicy, RunnerOptions, ScriptError, ScriptRunner};
use crate::transform::{TransformContext, TransformError, TransformRegistry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Scripts run before loading when the schemas are (re)built
pub const DEFAULT_PRE_SCRIPTS: &[&str] = &["01_schema.sql", "02_tables.sql", "03_constraints.sql"];

/// Scripts run after loading. Indexes come before foreign keys.
pub const DEFAULT_POST_SCRIPTS: &[&str] = &[
    "05_indexes.sql",
    "04_foreign_keys.sql",
    "06_comments.sql",
    "07_triggers.sql",
];

pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// The three destination schemas a table can be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalSchema {
    Core,
    Ingest,
    Audit,
}

impl fmt::Display for LogicalSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalSchema::Core => write!(f, "core"),
            LogicalSchema::Ingest => write!(f, "ingest"),
            LogicalSchema::Audit => write!(f, "audit"),
        }
    }
}

/// Physical names of the logical schemas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaNames {
    pub core: String,
    pub ingest: String,
    pub audit: String,
}

impl Default for SchemaNames {
    fn default() -> Self {
        Self {
            core: "core".to_string(),
            ingest: "ingest".to_string(),
            audit: "audit".to_string(),
        }
    }
}

impl SchemaNames {
    pub fn resolve(&self, schema: LogicalSchema) -> &str {
        match schema {
            LogicalSchema::Core => &self.core,
            LogicalSchema::Ingest => &self.ingest,
            LogicalSchema::Audit => &self.audit,
        }
    }

    /// core, ingest, audit
    pub fn all(&self) -> [&str; 3] {
        [&self.core, &self.ingest, &self.audit]
    }
}

/// Table name -> logical schema. Unlisted tables go to core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRoutes {
    routes: BTreeMap<String, LogicalSchema>,
}

impl Default for SchemaRoutes {
    fn default() -> Self {
        let routes = BTreeMap::from([
            ("ingest_events".to_string(), LogicalSchema::Ingest),
            ("entity_events".to_string(), LogicalSchema::Ingest),
            ("audit_log".to_string(), LogicalSchema::Audit),
        ]);
        Self { routes }
    }
}

impl SchemaRoutes {
    /// Add or replace a route.
    pub fn set(&mut self, table: impl Into<String>, schema: LogicalSchema) {
        self.routes.insert(table.into(), schema);
    }

    pub fn route(&self, table: &str) -> LogicalSchema {
        self.routes.get(table).copied().unwrap_or(LogicalSchema::Core)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, LogicalSchema)> + '_ {
        self.routes.iter().map(|(t, s)| (t.as_str(), *s))
    }
}

/// Settings for one load
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub sql_dir: PathBuf,
    pub schemas: SchemaNames,
    pub routes: SchemaRoutes,
    pub reset: ResetMode,
    /// Stop after the pre-DDL scripts
    pub ddl_only: bool,
    pub batch_size: usize,
    pub drop_extra_columns: bool,
    pub analyze: bool,
    /// Fail before any database work when a planned dataset is absent
    pub require_all_datasets: bool,
    /// Load unclaimed datasets into same-named existing tables
    pub fallback_unplanned: bool,
    /// Column whose sequence is resynced after loading
    pub id_column: String,
    pub pre_scripts: Vec<String>,
    pub post_scripts: Vec<String>,
    pub skip_missing_scripts: bool,
    pub ignore_sqlstates: BTreeSet<String>,
    /// Checked between tables and between script statements
    pub deadline: Option<Instant>,
    pub progress: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            sql_dir: PathBuf::from("sql"),
            schemas: SchemaNames::default(),
            routes: SchemaRoutes::default(),
            reset: ResetMode::default(),
            ddl_only: false,
            batch_size: DEFAULT_BATCH_SIZE,
            drop_extra_columns: true,
            analyze: false,
            require_all_datasets: false,
            fallback_unplanned: true,
            id_column: "id".to_string(),
            pre_scripts: DEFAULT_PRE_SCRIPTS.iter().map(|s| s.to_string()).collect(),
            post_scripts: DEFAULT_POST_SCRIPTS.iter().map(|s| s.to_string()).collect(),
            skip_missing_scripts: false,
            ignore_sqlstates: BTreeSet::new(),
            deadline: None,
            progress: false,
        }
    }
}

/// Outcome of a load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    tables_loaded: usize,
    rows_loaded: u64,
    /// `schema.table` -> rows written
    rows_by_table: BTreeMap<String, u64>,
    ddl_ran: bool,
}

impl LoadResult {
    pub fn tables_loaded(&self) -> usize {
        self.tables_loaded
    }

    pub fn rows_loaded(&self) -> u64 {
        self.rows_loaded
    }

    pub fn rows_by_table(&self) -> &BTreeMap<String, u64> {
        &self.rows_by_table
    }

    /// Whether the DDL scripts ran during this load
    pub fn ddl_ran(&self) -> bool {
        self.ddl_ran
    }
}

/// Errors that abort a load
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("batch size must be greater than zero")]
    InvalidBatchSize,

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("schema reset failed: {0}")]
    Reset(#[source] DbError),

    #[error("{table}: {source}")]
    Align {
        table: String,
        #[source]
        source: AlignError,
    },

    #[error("{table}: transform failed: {source}")]
    Transform {
        table: String,
        #[source]
        source: TransformError,
    },

    #[error("{table}: {source}")]
    Database {
        table: String,
        #[source]
        source: DbError,
    },

    #[error("ANALYZE failed: {0}")]
    Analyze(#[source] DbError),

    #[error("deadline exceeded before loading {table}")]
    DeadlineExceeded { table: String },
}

/// Internal outcome of loading one table
enum TableOutcome {
    Loaded(QualifiedName, u64),
    Skipped,
}

/// Drives a full load for one plan.
pub struct Loader {
    plan: LoadPlan,
    options: LoadOptions,
    transforms: TransformRegistry,
}

impl Loader {
    pub fn new(plan: LoadPlan, options: LoadOptions) -> Self {
        Self {
            plan,
            options,
            transforms: TransformRegistry::new(),
        }
    }

    pub fn with_transforms(mut self, transforms: TransformRegistry) -> Self {
        self.transforms = transforms;
        self
    }

    /// Run every phase of the load against `db`.
    pub fn run(&self, db: &mut dyn Database, datasets: &DatasetMap) -> Result<LoadResult, LoadError> {
        let opts = &self.options;
        if opts.batch_size == 0 {
            return Err(LoadError::InvalidBatchSize);
        }
        if opts.require_all_datasets {
            self.plan.validate_inputs(datasets)?;
        }

        let schemas = opts.schemas.all();
        let ddl_needed =
            reset::reset_schemas(db, opts.reset, &schemas).map_err(LoadError::Reset)?;

        if ddl_needed {
            info!(scripts = opts.pre_scripts.len(), "running pre-load DDL");
            self.script_runner(&opts.pre_scripts).run(db)?;
        }

        let mut result = LoadResult {
            ddl_ran: ddl_needed,
            ..LoadResult::default()
        };

        if opts.ddl_only {
            info!("DDL only: skipping inserts and post-load DDL");
            return Ok(result);
        }

        let ctx = TransformContext::new(datasets);
        let mut loaded: Vec<QualifiedName> = Vec::new();

        for spec in self.plan.insert_order() {
            self.check_deadline(&spec.name)?;
            let schema = opts.schemas.resolve(opts.routes.route(&spec.name));
            let target = QualifiedName::new(schema, spec.name.as_str());
            if let TableOutcome::Loaded(target, rows) =
                self.load_table(db, &target, spec.key(), datasets, &ctx)?
            {
                record(&mut result, &mut loaded, target, rows);
            }
        }

        if opts.fallback_unplanned {
            self.load_unplanned(db, datasets, &ctx, &mut result, &mut loaded)?;
        }

        let synced = sequence::sync_sequences(db, &loaded, &opts.id_column);
        debug!(synced, "sequence sync finished");

        if ddl_needed {
            info!(scripts = opts.post_scripts.len(), "running post-load DDL");
            self.script_runner(&opts.post_scripts).run(db)?;
        }

        if opts.analyze {
            info!("running ANALYZE");
            db.execute("ANALYZE").map_err(LoadError::Analyze)?;
        }

        info!(
            tables = result.tables_loaded,
            rows = result.rows_loaded,
            "load finished"
        );
        Ok(result)
    }

    /// Datasets no spec claims, matched to existing tables by key.
    fn load_unplanned(
        &self,
        db: &mut dyn Database,
        datasets: &DatasetMap,
        ctx: &TransformContext<'_>,
        result: &mut LoadResult,
        loaded: &mut Vec<QualifiedName>,
    ) -> Result<(), LoadError> {
        for key in datasets.keys() {
            if self.plan.claims_key(key) {
                continue;
            }
            let name = key.trim();
            if name.is_empty() {
                continue;
            }
            let target = match name.split_once('.') {
                Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                    QualifiedName::new(schema, table)
                }
                Some(_) => continue,
                None => QualifiedName::new(self.options.schemas.core.as_str(), name),
            };
            if loaded.contains(&target) {
                continue;
            }

            self.check_deadline(&target.table)?;

            match db.table_exists(&target.schema, &target.table) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(key = %key, table = %target, "no matching table for unplanned dataset");
                    continue;
                }
                Err(err) => {
                    warn!(key = %key, table = %target, "could not check table: {}", err);
                    continue;
                }
            }

            match self.load_table(db, &target, key, datasets, ctx) {
                Ok(TableOutcome::Loaded(target, rows)) => record(result, loaded, target, rows),
                Ok(TableOutcome::Skipped) => {}
                Err(err) => warn!(key = %key, "unplanned dataset not loaded: {}", err),
            }
        }
        Ok(())
    }

    fn load_table(
        &self,
        db: &mut dyn Database,
        target: &QualifiedName,
        key: &str,
        datasets: &DatasetMap,
        ctx: &TransformContext<'_>,
    ) -> Result<TableOutcome, LoadError> {
        let Some(source) = datasets.get(key) else {
            return Ok(TableOutcome::Skipped);
        };
        if source.is_empty() {
            return Ok(TableOutcome::Skipped);
        }

        let table = target.to_string();
        let db_err = |source| LoadError::Database {
            table: table.clone(),
            source,
        };

        if !db.table_exists(&target.schema, &target.table).map_err(db_err)? {
            warn!(table = %target, key, "table does not exist, skipping");
            return Ok(TableOutcome::Skipped);
        }

        let mut dataset = source.clone();
        dataset.normalize_nulls();
        let dataset = self
            .transforms
            .apply(&target.table, dataset, ctx)
            .map_err(|source| LoadError::Transform {
                table: table.clone(),
                source,
            })?;

        let columns = db.columns(&target.schema, &target.table).map_err(db_err)?;
        let dataset = align_to_table(dataset, &columns, self.options.drop_extra_columns, &table)
            .map_err(|source| LoadError::Align {
                table: table.clone(),
                source,
            })?;

        if dataset.column_count() == 0 {
            warn!(table = %target, "no columns in common with destination, skipping");
            return Ok(TableOutcome::Skipped);
        }

        info!(
            table = %target,
            rows = dataset.row_count(),
            columns = dataset.column_count(),
            "loading"
        );
        let rows = self.insert_dataset(db, target, &dataset)?;
        Ok(TableOutcome::Loaded(target.clone(), rows))
    }

    /// Append `dataset` in batches inside one transaction.
    fn insert_dataset(
        &self,
        db: &mut dyn Database,
        target: &QualifiedName,
        dataset: &Dataset,
    ) -> Result<u64, LoadError> {
        let db_err = |source| LoadError::Database {
            table: target.to_string(),
            source,
        };

        let columns: Vec<String> = dataset.column_names().iter().map(|s| s.to_string()).collect();
        let total = dataset.row_count();
        let progress = row_progress(self.options.progress, total, &target.to_string());

        db.begin().map_err(db_err)?;
        let mut written = 0u64;
        let mut start = 0;
        while start < total {
            let end = (start + self.options.batch_size).min(total);
            let rows = dataset.rows(start..end);
            match db.insert_rows(target, &columns, &rows) {
                Ok(n) => written += n,
                Err(err) => {
                    if let Err(rb) = db.rollback() {
                        warn!(table = %target, "rollback failed: {}", rb);
                    }
                    if let Some(pb) = &progress {
                        pb.abandon();
                    }
                    return Err(db_err(err));
                }
            }
            if let Some(pb) = &progress {
                pb.set_position(end as u64);
            }
            start = end;
        }
        db.commit().map_err(db_err)?;

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        Ok(written)
    }

    fn script_runner(&self, files: &[String]) -> ScriptRunner {
        ScriptRunner::new(&self.options.sql_dir, files.iter().cloned()).with_options(RunnerOptions {
            policy: ErrorPolicy::Abort,
            skip_missing: self.options.skip_missing_scripts,
            ignore_codes: self.options.ignore_sqlstates.clone(),
            deadline: self.options.deadline,
        })
    }

    fn check_deadline(&self, table: &str) -> Result<(), LoadError> {
        match self.options.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(LoadError::DeadlineExceeded {
                table: table.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

fn record(result: &mut LoadResult, loaded: &mut Vec<QualifiedName>, target: QualifiedName, rows: u64) {
    result.rows_by_table.insert(target.to_string(), rows);
    result.tables_loaded = result.rows_by_table.len();
    result.rows_loaded = result.rows_by_table.values().sum();
    if !loaded.contains(&target) {
        loaded.push(target);
    }
}
