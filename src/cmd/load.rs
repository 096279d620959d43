use anyhow::{bail, Context};
use serde::Serialize;
use sql_seed::config::Manifest;
use sql_seed::dataset::{read_csv_dir, DatasetMap};
use sql_seed::db::PgDatabase;
use sql_seed::loader::{LoadResult, Loader, ResetMode, SchemaNames};
use sql_seed::plan::LoadPlan;
use sql_seed::runner::normalize_sqlstates;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Command-line values that replace manifest fields
pub(crate) struct Overrides {
    pub dsn: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub sql_dir: Option<PathBuf>,
    pub reset: Option<String>,
    pub ddl_only: bool,
    pub batch_size: Option<usize>,
    pub strict_columns: bool,
    pub require_all: bool,
    pub analyze: bool,
    pub timeout: Option<u64>,
}

impl Overrides {
    fn apply(self, manifest: &mut Manifest) -> anyhow::Result<()> {
        if let Some(dsn) = self.dsn {
            manifest.dsn = Some(dsn);
        }
        if let Some(dir) = self.data_dir {
            manifest.data_dir = Some(dir);
        }
        if let Some(dir) = self.sql_dir {
            manifest.sql_dir = dir;
        }
        if let Some(reset) = self.reset {
            manifest.reset = reset.parse::<ResetMode>().map_err(anyhow::Error::msg)?;
        }
        if let Some(size) = self.batch_size {
            manifest.batch_size = size;
        }
        if let Some(secs) = self.timeout {
            manifest.timeout_secs = Some(secs);
        }
        manifest.ddl_only |= self.ddl_only;
        manifest.analyze |= self.analyze;
        manifest.require_all_datasets |= self.require_all;
        if self.strict_columns {
            manifest.drop_extra_columns = false;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct LoadJsonOutput<'a> {
    reset: String,
    elapsed_secs: f64,
    #[serde(flatten)]
    result: &'a LoadResult,
}

#[derive(Serialize)]
struct DryRunJsonOutput {
    dry_run: bool,
    settings: DryRunSettings,
    tables: Vec<DryRunTable>,
    unplanned_datasets: Vec<String>,
}

/// Resolved manifest values after command-line overrides
#[derive(Serialize)]
struct DryRunSettings {
    reset: String,
    ddl_only: bool,
    batch_size: usize,
    drop_extra_columns: bool,
    sql_dir: PathBuf,
    schemas: SchemaNames,
    schema_routes: BTreeMap<String, String>,
    pre_scripts: Vec<String>,
    post_scripts: Vec<String>,
    ignore_sqlstates: Vec<String>,
}

impl DryRunSettings {
    fn from_manifest(manifest: &Manifest) -> Self {
        let schema_routes = manifest
            .routes()
            .iter()
            .map(|(table, schema)| (table.to_string(), manifest.schemas.resolve(schema).to_string()))
            .collect();
        Self {
            reset: manifest.reset.to_string(),
            ddl_only: manifest.ddl_only,
            batch_size: manifest.batch_size,
            drop_extra_columns: manifest.drop_extra_columns,
            sql_dir: manifest.sql_dir.clone(),
            schemas: manifest.schemas.clone(),
            schema_routes,
            pre_scripts: manifest.scripts.pre.clone(),
            post_scripts: manifest.scripts.post.clone(),
            ignore_sqlstates: normalize_sqlstates(&manifest.scripts.ignore_sqlstates)
                .into_iter()
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct DryRunTable {
    table: String,
    dataset: String,
    mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<usize>,
}

pub fn run(
    manifest_path: Option<PathBuf>,
    overrides: Overrides,
    progress: bool,
    dry_run: bool,
    json: bool,
) -> anyhow::Result<()> {
    let mut manifest = match &manifest_path {
        Some(path) => Manifest::load(path)?,
        None => Manifest::default(),
    };
    overrides.apply(&mut manifest)?;

    let plan = manifest.plan().context("invalid load plan")?;
    let datasets = read_datasets(&manifest)?;

    if dry_run {
        return report_dry_run(&manifest, &plan, &datasets, json);
    }

    if !manifest.ddl_only && manifest.data_dir.is_none() {
        bail!("no data directory: pass --data-dir or set `data_dir` in the manifest");
    }

    let mut options = manifest.load_options()?;
    options.progress = progress && !json;
    let dsn = manifest.resolve_dsn(None)?;

    if !json {
        println!(
            "Loading {} planned tables (reset: {}, batch size: {})",
            plan.insert_order().count(),
            manifest.reset,
            manifest.batch_size
        );
        println!("Scripts: {}\n", manifest.sql_dir.display());
    }

    let start = Instant::now();
    let mut db = PgDatabase::connect(&dsn).context("failed to connect to database")?;
    let loader = Loader::new(plan, options).with_transforms(manifest.transforms());
    let result = loader.run(&mut db, &datasets)?;
    let elapsed = start.elapsed();

    if json {
        let output = LoadJsonOutput {
            reset: manifest.reset.to_string(),
            elapsed_secs: elapsed.as_secs_f64(),
            result: &result,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if manifest.ddl_only {
        println!("✓ DDL completed (no data loaded)");
    } else {
        println!("✓ Load completed successfully!");
    }
    println!("\nStatistics:");
    println!("  DDL executed: {}", if result.ddl_ran() { "yes" } else { "no" });
    println!("  Tables loaded: {}", result.tables_loaded());
    println!("  Rows loaded: {}", result.rows_loaded());
    println!("  Elapsed time: {:.3?}", elapsed);

    if !result.rows_by_table().is_empty() {
        println!("\nRows by table:");
        for (table, rows) in result.rows_by_table() {
            println!("  {:<40} {:>10}", table, rows);
        }
    }

    Ok(())
}

fn read_datasets(manifest: &Manifest) -> anyhow::Result<DatasetMap> {
    match &manifest.data_dir {
        Some(dir) => read_dir(dir),
        None => Ok(DatasetMap::new()),
    }
}

fn read_dir(dir: &Path) -> anyhow::Result<DatasetMap> {
    read_csv_dir(dir).with_context(|| format!("failed to read datasets from {}", dir.display()))
}

fn print_settings(settings: &DryRunSettings) {
    let list = |items: &[String]| {
        if items.is_empty() {
            "(none)".to_string()
        } else {
            items.join(", ")
        }
    };

    println!("Settings:");
    println!("  Reset mode:     {}", settings.reset);
    if settings.ddl_only {
        println!("  DDL only:       yes");
    }
    println!("  Batch size:     {}", settings.batch_size);
    println!("  Drop extras:    {}", if settings.drop_extra_columns { "yes" } else { "no" });
    println!("  SQL dir:        {}", settings.sql_dir.display());
    println!(
        "  Schemas:        core={} ingest={} audit={}",
        settings.schemas.core, settings.schemas.ingest, settings.schemas.audit
    );
    println!("  Pre scripts:    {}", list(&settings.pre_scripts));
    println!("  Post scripts:   {}", list(&settings.post_scripts));
    if !settings.ignore_sqlstates.is_empty() {
        println!("  Ignored codes:  {}", settings.ignore_sqlstates.join(", "));
    }
    if !settings.schema_routes.is_empty() {
        println!("  Schema routes:");
        for (table, schema) in &settings.schema_routes {
            println!("    {:<28} -> {}", table, schema);
        }
    }
}

fn report_dry_run(
    manifest: &Manifest,
    plan: &LoadPlan,
    datasets: &DatasetMap,
    json: bool,
) -> anyhow::Result<()> {
    if manifest.require_all_datasets {
        plan.validate_inputs(datasets)?;
    }

    let tables: Vec<DryRunTable> = plan
        .order()
        .map(|spec| DryRunTable {
            table: spec.name.clone(),
            dataset: spec.key().to_string(),
            mode: spec.mode.to_string(),
            rows: datasets.get(spec.key()).map(|d| d.row_count()),
        })
        .collect();
    let unplanned: Vec<String> = datasets
        .keys()
        .filter(|key| !plan.claims_key(key))
        .cloned()
        .collect();
    let settings = DryRunSettings::from_manifest(manifest);

    if json {
        let output = DryRunJsonOutput {
            dry_run: true,
            settings,
            tables,
            unplanned_datasets: unplanned,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("✓ Dry run completed!\n");
    print_settings(&settings);
    println!("\nLoad order:");
    for (i, table) in tables.iter().enumerate() {
        let rows = match table.rows {
            Some(rows) => format!("{} rows", rows),
            None => "no dataset".to_string(),
        };
        println!(
            "  {:>3}. {:<32} [{}] {} ({})",
            i + 1,
            table.table,
            table.mode,
            table.dataset,
            rows
        );
    }
    if manifest.fallback_unplanned && !unplanned.is_empty() {
        println!("\nUnplanned datasets (loaded into matching tables if they exist):");
        for key in &unplanned {
            println!("  - {}", key);
        }
    }
    Ok(())
}
