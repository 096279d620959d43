//! Dependency graph over table specs.
//!
//! Provides:
//! - Graph construction from `depends_on` declarations
//! - Topological sorting (Kahn's algorithm) for load order
//! - Cycle reporting with each stuck table's unresolved dependencies

use super::{PlanError, TableSpec};
use ahash::AHashMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Dependency graph where an edge runs from a dependency to its dependents.
#[derive(Debug)]
pub(crate) struct DependencyGraph<'a> {
    specs: &'a [TableSpec],
    /// For each spec, the specs it depends on
    parents: Vec<Vec<usize>>,
    /// For each spec, the specs that depend on it
    children: Vec<Vec<usize>>,
}

impl<'a> DependencyGraph<'a> {
    /// Build the graph, rejecting duplicate names and unknown dependencies.
    pub(crate) fn build(specs: &'a [TableSpec]) -> Result<Self, PlanError> {
        let mut by_name: AHashMap<&str, usize> = AHashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if by_name.insert(spec.name.as_str(), i).is_some() {
                return Err(PlanError::DuplicateTable(spec.name.clone()));
            }
        }

        let n = specs.len();
        let mut parents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (child, spec) in specs.iter().enumerate() {
            for dep in &spec.depends_on {
                let Some(&parent) = by_name.get(dep.as_str()) else {
                    return Err(PlanError::MissingDependency {
                        table: spec.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                if !parents[child].contains(&parent) {
                    parents[child].push(parent);
                    children[parent].push(child);
                }
            }
        }

        Ok(Self {
            specs,
            parents,
            children,
        })
    }

    /// Topological order of spec indices, dependencies first.
    ///
    /// Ready specs are taken in declaration order. Specs left with unresolved
    /// dependencies are reported as a cycle.
    pub(crate) fn topo_sort(&self) -> Result<Vec<usize>, PlanError> {
        let n = self.specs.len();
        let mut in_degree: Vec<usize> = self.parents.iter().map(Vec::len).collect();

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &child in &self.children[id] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    queue.push_back(child);
                }
            }
        }

        if order.len() == n {
            return Ok(order);
        }

        let mut placed = vec![false; n];
        for &id in &order {
            placed[id] = true;
        }

        let unresolved: BTreeMap<String, BTreeSet<String>> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| {
                let deps = self.parents[i]
                    .iter()
                    .filter(|&&p| !placed[p])
                    .map(|&p| self.specs[p].name.clone())
                    .collect();
                (self.specs[i].name.clone(), deps)
            })
            .collect();

        Err(PlanError::Cycle { unresolved })
    }
}
