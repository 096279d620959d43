use anyhow::Context;
use sql_seed::config::Manifest;
use sql_seed::db::PgDatabase;
use sql_seed::runner::{normalize_sqlstates, ErrorPolicy, RunnerOptions, ScriptRunner};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[allow(clippy::too_many_arguments)]
pub fn run(
    files: Vec<String>,
    sql_dir: PathBuf,
    dsn: Option<String>,
    policy: String,
    skip_missing: bool,
    ignore_sqlstate: Vec<String>,
    timeout: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let policy: ErrorPolicy = policy.parse().map_err(anyhow::Error::msg)?;
    let dsn = Manifest::default().resolve_dsn(dsn.as_deref())?;

    let options = RunnerOptions {
        policy,
        skip_missing,
        ignore_codes: normalize_sqlstates(&ignore_sqlstate),
        deadline: timeout.map(|secs| Instant::now() + Duration::from_secs(secs)),
    };
    let runner = ScriptRunner::new(sql_dir, files).with_options(options);

    let start = Instant::now();
    let mut db = PgDatabase::connect(&dsn).context("failed to connect to database")?;
    let report = runner.run(&mut db)?;
    let elapsed = start.elapsed();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("✓ Executed {} scripts ({})", report.files.len(), policy);
    for file in &report.files {
        println!(
            "  {:<32} executed {:>5}  failed {:>3}  ignored {:>3}  skipped {:>3}",
            file.file, file.executed, file.failed, file.ignored, file.skipped
        );
    }
    for missing in &report.missing {
        println!("  {:<32} (missing, skipped)", missing);
    }
    println!("\n  Statements executed: {}", report.executed());
    if report.failed() > 0 {
        println!("  Statements failed: {}", report.failed());
    }
    println!("  Elapsed time: {:.3?}", elapsed);
    Ok(())
}
