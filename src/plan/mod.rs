//! Load planning: which tables to write, and in what order.
//!
//! This module provides:
//! - [`TableSpec`], the declaration of one destination table and its dependencies
//! - [`LoadPlan`], an immutable, dependency-resolved load order
//! - Derived views (table names, dataset keys) and input validation

mod graph;

use crate::dataset::DatasetMap;
use graph::DependencyGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// How a planned table is treated during a load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecMode {
    /// Append the table's dataset
    #[default]
    Insert,
    /// Keep the table in the dependency graph but do not load it
    Skip,
}

impl fmt::Display for SpecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecMode::Insert => write!(f, "insert"),
            SpecMode::Skip => write!(f, "skip"),
        }
    }
}

/// One destination table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Destination table name
    pub name: String,
    /// Key into the dataset map; defaults to `name`
    #[serde(default, rename = "dataset", alias = "dataset_key", skip_serializing_if = "Option::is_none")]
    pub dataset_key: Option<String>,
    /// Tables that must be loaded first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub mode: SpecMode,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dataset_key: None,
            depends_on: Vec::new(),
            mode: SpecMode::Insert,
        }
    }

    pub fn with_dataset_key(mut self, key: impl Into<String>) -> Self {
        self.dataset_key = Some(key.into());
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: SpecMode) -> Self {
        self.mode = mode;
        self
    }

    /// The dataset map key for this table.
    pub fn key(&self) -> &str {
        self.dataset_key.as_deref().unwrap_or(&self.name)
    }

    pub fn is_insert(&self) -> bool {
        self.mode == SpecMode::Insert
    }
}

/// Errors building or checking a load plan
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("dependency '{dependency}' does not exist (required by '{table}')")]
    MissingDependency { table: String, dependency: String },

    #[error("table '{0}' is declared more than once")]
    DuplicateTable(String),

    #[error("dependency cycle or unresolvable dependencies: {}", format_unresolved(.unresolved))]
    Cycle {
        /// Stuck table -> dependencies that never resolved
        unresolved: BTreeMap<String, BTreeSet<String>>,
    },

    #[error("missing datasets for planned tables: {}", .0.join(", "))]
    MissingDatasets(Vec<String>),
}

fn format_unresolved(unresolved: &BTreeMap<String, BTreeSet<String>>) -> String {
    unresolved
        .iter()
        .map(|(table, deps)| {
            let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
            format!("{} -> {{{}}}", table, deps.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// A dependency-resolved load order. Immutable once built.
#[derive(Debug, Clone)]
pub struct LoadPlan {
    specs: Vec<TableSpec>,
    /// Indices into `specs`, dependencies first
    order: Vec<usize>,
}

impl LoadPlan {
    /// Resolve the load order for `specs`.
    pub fn new(specs: Vec<TableSpec>) -> Result<Self, PlanError> {
        let order = DependencyGraph::build(&specs)?.topo_sort()?;
        Ok(Self { specs, order })
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// All specs in load order, including skipped ones
    pub fn order(&self) -> impl Iterator<Item = &TableSpec> + '_ {
        self.order.iter().map(move |&i| &self.specs[i])
    }

    /// INSERT-mode specs in load order
    pub fn insert_order(&self) -> impl Iterator<Item = &TableSpec> + '_ {
        self.order().filter(|s| s.is_insert())
    }

    pub fn table_names_in_order(&self) -> Vec<&str> {
        self.insert_order().map(|s| s.name.as_str()).collect()
    }

    pub fn keys_in_order(&self) -> Vec<&str> {
        self.insert_order().map(TableSpec::key).collect()
    }

    /// Whether any spec, in any mode, reads `key`.
    pub fn claims_key(&self, key: &str) -> bool {
        self.specs.iter().any(|s| s.key() == key)
    }

    /// Fail when an INSERT-mode spec has no dataset in `datasets`.
    pub fn validate_inputs(&self, datasets: &DatasetMap) -> Result<(), PlanError> {
        let missing: Vec<String> = self
            .insert_order()
            .filter(|s| !datasets.contains_key(s.key()))
            .map(|s| s.key().to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PlanError::MissingDatasets(missing))
        }
    }
}
