mod exec;
mod load;
mod plan;
mod split;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sql-seed")]
#[command(version)]
#[command(about = "Load tabular datasets into PostgreSQL through ordered SQL scripts", long_about = None)]
pub struct Cli {
    /// Log level filter, e.g. info or sql_seed=debug (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reset the target schemas, run DDL scripts and load datasets
    Load {
        /// Load manifest (YAML); defaults apply when omitted
        manifest: Option<PathBuf>,

        /// Database DSN (overrides manifest, SQL_SEED_DSN and DATABASE_URL)
        #[arg(long)]
        dsn: Option<String>,

        /// Directory of CSV datasets, one file per table
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Directory holding the DDL scripts
        #[arg(short, long)]
        sql_dir: Option<PathBuf>,

        /// Schema reset mode: recreate or truncate
        #[arg(short, long)]
        reset: Option<String>,

        /// Only reset and run the pre-load DDL
        #[arg(long)]
        ddl_only: bool,

        /// Rows per INSERT batch
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Fail on dataset columns the destination does not have
        #[arg(long)]
        strict_columns: bool,

        /// Fail when a planned dataset is missing
        #[arg(long)]
        require_all: bool,

        /// Run ANALYZE after loading
        #[arg(long)]
        analyze: bool,

        /// Give up after this many seconds (checked between statements and tables)
        #[arg(long)]
        timeout: Option<u64>,

        /// Show progress while inserting
        #[arg(short, long)]
        progress: bool,

        /// Validate the plan and datasets without connecting
        #[arg(long)]
        dry_run: bool,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the resolved load order of a manifest
    Plan {
        /// Load manifest (YAML)
        manifest: PathBuf,

        /// Check planned datasets against this CSV directory
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Fail when a planned dataset is missing (uses the manifest's data_dir by default)
        #[arg(long)]
        check: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the statements of a SQL script with their start lines
    Split {
        /// SQL script
        file: PathBuf,

        /// Print full statements instead of excerpts
        #[arg(long)]
        full: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run SQL scripts against a database, one transaction per file
    Exec {
        /// Script file names, relative to --sql-dir, in execution order
        #[arg(required = true)]
        files: Vec<String>,

        /// Directory holding the scripts
        #[arg(short, long, default_value = "sql")]
        sql_dir: PathBuf,

        /// Database DSN (overrides SQL_SEED_DSN and DATABASE_URL)
        #[arg(long)]
        dsn: Option<String>,

        /// Error policy: abort or continue
        #[arg(long, default_value = "abort")]
        policy: String,

        /// Skip listed files that do not exist
        #[arg(long)]
        skip_missing: bool,

        /// SQLSTATE codes to treat as success (comma-separated)
        #[arg(long, value_delimiter = ',')]
        ignore_sqlstate: Vec<String>,

        /// Give up after this many seconds (checked between statements)
        #[arg(long)]
        timeout: Option<u64>,

        /// Output the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Load {
            manifest,
            dsn,
            data_dir,
            sql_dir,
            reset,
            ddl_only,
            batch_size,
            strict_columns,
            require_all,
            analyze,
            timeout,
            progress,
            dry_run,
            json,
        } => load::run(
            manifest,
            load::Overrides {
                dsn,
                data_dir,
                sql_dir,
                reset,
                ddl_only,
                batch_size,
                strict_columns,
                require_all,
                analyze,
                timeout,
            },
            progress,
            dry_run,
            json,
        ),
        Commands::Plan {
            manifest,
            data_dir,
            check,
            json,
        } => plan::run(manifest, data_dir, check, json),
        Commands::Split { file, full, json } => split::run(file, full, json),
        Commands::Exec {
            files,
            sql_dir,
            dsn,
            policy,
            skip_missing,
            ignore_sqlstate,
            timeout,
            json,
        } => exec::run(
            files,
            sql_dir,
            dsn,
            policy,
            skip_missing,
            ignore_sqlstate,
            timeout,
            json,
        ),
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "sql-seed", &mut io::stdout());
            Ok(())
        }
    }
}
