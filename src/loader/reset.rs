//! Schema reset strategies.

use crate::db::{Database, DbError, QualifiedName};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// How target schemas are reset before a load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    /// Drop the schemas and rebuild them from the DDL scripts
    #[default]
    #[serde(alias = "drop_create")]
    Recreate,
    /// Empty existing tables; run DDL only if nothing exists yet
    Truncate,
}

impl std::str::FromStr for ResetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "recreate" | "drop_create" => Ok(ResetMode::Recreate),
            "truncate" => Ok(ResetMode::Truncate),
            _ => Err(format!(
                "Unknown reset mode: {}. Valid options: recreate, truncate",
                s
            )),
        }
    }
}

impl fmt::Display for ResetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetMode::Recreate => write!(f, "recreate"),
            ResetMode::Truncate => write!(f, "truncate"),
        }
    }
}

/// Reset `schemas`; returns whether the DDL scripts must run.
pub(crate) fn reset_schemas(
    db: &mut dyn Database,
    mode: ResetMode,
    schemas: &[&str],
) -> Result<bool, DbError> {
    match mode {
        ResetMode::Recreate => {
            for schema in schemas {
                info!(schema = %schema, "dropping schema");
                db.drop_schema(schema)?;
            }
            Ok(true)
        }
        ResetMode::Truncate => {
            for schema in schemas {
                db.create_schema(schema)?;
            }
            let mut tables: Vec<QualifiedName> = Vec::new();
            for schema in schemas {
                tables.extend(db.base_tables(schema)?);
            }
            if tables.is_empty() {
                info!("no tables to truncate; treating database as uninitialized");
                return Ok(true);
            }
            db.truncate_tables(&tables)?;
            info!(tables = tables.len(), "truncated existing tables");
            Ok(false)
        }
    }
}
