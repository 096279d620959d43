//! YAML manifest describing a load.
//!
//! ```yaml
//! dsn: postgresql://app@localhost/app
//! sql_dir: sql
//! data_dir: data
//! reset: truncate
//! batch_size: 2000
//! schema_routes:
//!   audit_trail: audit
//! tables:
//!   - name: customers
//!   - name: orders
//!     depends_on: [customers]
//!     transforms:
//!       - rename: { CustomerId: customer_id }
//! ```
//!
//! Relative `sql_dir` and `data_dir` paths are resolved against the manifest's
//! own directory.

use crate::loader::{
    LoadOptions, LogicalSchema, ResetMode, SchemaNames, SchemaRoutes, DEFAULT_BATCH_SIZE,
    DEFAULT_POST_SCRIPTS, DEFAULT_PRE_SCRIPTS,
};
use crate::plan::{LoadPlan, PlanError, SpecMode, TableSpec};
use crate::runner::normalize_sqlstates;
use crate::transform::{TransformConfig, TransformRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Environment variables consulted for the DSN, in order
pub const DSN_ENV_VARS: &[&str] = &["SQL_SEED_DSN", "DATABASE_URL"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read manifest {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("no database DSN: pass --dsn, set `dsn` in the manifest, or set SQL_SEED_DSN / DATABASE_URL")]
    MissingDsn,

    #[error("batch_size must be greater than zero")]
    InvalidBatchSize,

    #[error("timeout_secs must be greater than zero")]
    InvalidTimeout,
}

/// Script lists and how the runner treats them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptsConfig {
    pub pre: Vec<String>,
    pub post: Vec<String>,
    pub skip_missing: bool,
    /// SQLSTATE codes treated as success, e.g. `42P07` (duplicate table)
    pub ignore_sqlstates: Vec<String>,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            pre: DEFAULT_PRE_SCRIPTS.iter().map(|s| s.to_string()).collect(),
            post: DEFAULT_POST_SCRIPTS.iter().map(|s| s.to_string()).collect(),
            skip_missing: false,
            ignore_sqlstates: Vec::new(),
        }
    }
}

/// One `tables:` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,
    #[serde(default, alias = "dataset_key")]
    pub dataset: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub mode: SpecMode,
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,
}

impl TableConfig {
    pub fn to_spec(&self) -> TableSpec {
        TableSpec {
            name: self.name.clone(),
            dataset_key: self.dataset.clone(),
            depends_on: self.depends_on.clone(),
            mode: self.mode,
        }
    }
}

/// A load manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Manifest {
    pub dsn: Option<String>,
    pub sql_dir: PathBuf,
    pub data_dir: Option<PathBuf>,
    pub schemas: SchemaNames,
    pub reset: ResetMode,
    pub ddl_only: bool,
    pub batch_size: usize,
    pub drop_extra_columns: bool,
    pub analyze: bool,
    pub require_all_datasets: bool,
    pub fallback_unplanned: bool,
    pub id_column: String,
    pub timeout_secs: Option<u64>,
    pub scripts: ScriptsConfig,
    /// Routes added to (or replacing) the built-in ones
    pub schema_routes: BTreeMap<String, LogicalSchema>,
    pub tables: Vec<TableConfig>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            dsn: None,
            sql_dir: PathBuf::from("sql"),
            data_dir: None,
            schemas: SchemaNames::default(),
            reset: ResetMode::default(),
            ddl_only: false,
            batch_size: DEFAULT_BATCH_SIZE,
            drop_extra_columns: true,
            analyze: false,
            require_all_datasets: false,
            fallback_unplanned: true,
            id_column: "id".to_string(),
            timeout_secs: None,
            scripts: ScriptsConfig::default(),
            schema_routes: BTreeMap::new(),
            tables: Vec::new(),
        }
    }
}

impl Manifest {
    /// Read a manifest file and resolve its relative paths.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest: Manifest =
            serde_yaml_ng::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        manifest.resolve_paths(base);
        Ok(manifest)
    }

    /// Make relative directories relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.sql_dir.is_relative() {
            self.sql_dir = base.join(&self.sql_dir);
        }
        if let Some(dir) = &self.data_dir {
            if dir.is_relative() {
                self.data_dir = Some(base.join(dir));
            }
        }
    }

    /// DSN by precedence: `cli`, the manifest, then the environment.
    pub fn resolve_dsn(&self, cli: Option<&str>) -> Result<String, ConfigError> {
        let env = DSN_ENV_VARS.iter().find_map(|var| std::env::var(var).ok());
        [cli.map(str::to_string), self.dsn.clone(), env]
            .into_iter()
            .flatten()
            .map(|dsn| dsn.trim().to_string())
            .find(|dsn| !dsn.is_empty())
            .ok_or(ConfigError::MissingDsn)
    }

    pub fn table_specs(&self) -> Vec<TableSpec> {
        self.tables.iter().map(TableConfig::to_spec).collect()
    }

    pub fn plan(&self) -> Result<LoadPlan, PlanError> {
        LoadPlan::new(self.table_specs())
    }

    /// Transform chains declared under `tables:`.
    pub fn transforms(&self) -> TransformRegistry {
        let mut registry = TransformRegistry::new();
        for table in &self.tables {
            for config in &table.transforms {
                registry.register(table.name.clone(), config.build());
            }
        }
        registry
    }

    /// Built-in routes overlaid with `schema_routes`.
    pub fn routes(&self) -> SchemaRoutes {
        let mut routes = SchemaRoutes::default();
        for (table, schema) in &self.schema_routes {
            routes.set(table.clone(), *schema);
        }
        routes
    }

    /// Loader settings; the deadline is measured from now.
    pub fn load_options(&self) -> Result<LoadOptions, ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        let deadline = match self.timeout_secs {
            Some(0) => return Err(ConfigError::InvalidTimeout),
            Some(secs) => Some(Instant::now() + Duration::from_secs(secs)),
            None => None,
        };

        Ok(LoadOptions {
            sql_dir: self.sql_dir.clone(),
            schemas: self.schemas.clone(),
            routes: self.routes(),
            reset: self.reset,
            ddl_only: self.ddl_only,
            batch_size: self.batch_size,
            drop_extra_columns: self.drop_extra_columns,
            analyze: self.analyze,
            require_all_datasets: self.require_all_datasets,
            fallback_unplanned: self.fallback_unplanned,
            id_column: self.id_column.clone(),
            pre_scripts: self.scripts.pre.clone(),
            post_scripts: self.scripts.post.clone(),
            skip_missing_scripts: self.scripts.skip_missing,
            ignore_sqlstates: normalize_sqlstates(&self.scripts.ignore_sqlstates),
            deadline,
            progress: false,
        })
    }
}
