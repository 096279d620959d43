use anyhow::{bail, Context};
use serde::Serialize;
use sql_seed::config::Manifest;
use sql_seed::dataset::read_csv_dir;
use std::path::PathBuf;

#[derive(Serialize)]
struct PlanJsonOutput {
    tables: Vec<PlanEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    missing_datasets: Vec<String>,
}

#[derive(Serialize)]
struct PlanEntry {
    position: usize,
    table: String,
    schema: String,
    dataset: String,
    mode: String,
    depends_on: Vec<String>,
}

pub fn run(manifest_path: PathBuf, data_dir: Option<PathBuf>, check: bool, json: bool) -> anyhow::Result<()> {
    let manifest = Manifest::load(&manifest_path)?;
    let plan = manifest.plan().context("invalid load plan")?;
    let routes = manifest.routes();

    let tables: Vec<PlanEntry> = plan
        .order()
        .enumerate()
        .map(|(i, spec)| PlanEntry {
            position: i + 1,
            table: spec.name.clone(),
            schema: manifest.schemas.resolve(routes.route(&spec.name)).to_string(),
            dataset: spec.key().to_string(),
            mode: spec.mode.to_string(),
            depends_on: spec.depends_on.clone(),
        })
        .collect();

    let mut missing = Vec::new();
    if check {
        let Some(dir) = data_dir.or_else(|| manifest.data_dir.clone()) else {
            bail!("--check needs a data directory: pass --data-dir or set `data_dir` in the manifest");
        };
        let datasets = read_csv_dir(&dir)
            .with_context(|| format!("failed to read datasets from {}", dir.display()))?;
        missing = plan
            .insert_order()
            .filter(|spec| !datasets.contains_key(spec.key()))
            .map(|spec| spec.key().to_string())
            .collect();
    }

    if json {
        let output = PlanJsonOutput {
            tables,
            missing_datasets: missing.clone(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Load order ({} tables):\n", tables.len());
        for entry in &tables {
            let deps = if entry.depends_on.is_empty() {
                String::new()
            } else {
                format!(" <- {}", entry.depends_on.join(", "))
            };
            println!(
                "  {:>3}. {}.{} [{}]{}",
                entry.position, entry.schema, entry.table, entry.mode, deps
            );
        }
        if check && missing.is_empty() {
            println!("\n✓ All planned datasets present");
        }
    }

    if !missing.is_empty() {
        bail!("missing datasets for planned tables: {}", missing.join(", "));
    }
    Ok(())
}
