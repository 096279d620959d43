//! End-to-end load tests against the in-memory database.

mod common;

use common::{col, identity, write_scripts, FakeDb};
use sql_seed::dataset::{Dataset, DatasetMap, Value};
use sql_seed::db::DbError;
use sql_seed::loader::{AlignError, LoadError, LoadOptions, Loader, ResetMode};
use sql_seed::plan::{LoadPlan, PlanError, TableSpec};
use sql_seed::transform::{
    DatasetTransform, RenameColumns, TransformContext, TransformError, TransformRegistry,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const SCHEMA_SQL: &str = "\
CREATE SCHEMA IF NOT EXISTS core;
CREATE SCHEMA IF NOT EXISTS ingest;
CREATE SCHEMA IF NOT EXISTS audit;
";

const TABLES_SQL: &str = "\
-- customers first, orders reference them
CREATE TABLE core.customers (
    id bigserial PRIMARY KEY,
    name text NOT NULL,
    email text
);

CREATE TABLE core.orders (
    id bigserial PRIMARY KEY,
    customer_id bigint NOT NULL,
    total numeric(10,2)
);

CREATE TABLE audit.audit_log (
    id bigint GENERATED BY DEFAULT AS IDENTITY,
    action text NOT NULL
);
";

const TRIGGERS_SQL: &str = "\
CREATE FUNCTION core.touch() RETURNS trigger AS $$
BEGIN
    NEW.updated_at = now();
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;
";

fn script_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_scripts(
        dir.path(),
        &[
            ("01_schema.sql", SCHEMA_SQL),
            ("02_tables.sql", TABLES_SQL),
            ("03_constraints.sql", "-- nothing before load\n"),
            ("05_indexes.sql", "CREATE INDEX orders_customer_idx ON core.orders (customer_id);"),
            (
                "04_foreign_keys.sql",
                "ALTER TABLE core.orders ADD CONSTRAINT orders_customer_fk FOREIGN KEY (customer_id) REFERENCES core.customers (id);",
            ),
            ("06_comments.sql", "COMMENT ON TABLE core.orders IS 'one row per checkout; append only';"),
            ("07_triggers.sql", TRIGGERS_SQL),
        ],
    );
    dir
}

fn options(sql_dir: &Path) -> LoadOptions {
    LoadOptions {
        sql_dir: sql_dir.to_path_buf(),
        ..LoadOptions::default()
    }
}

fn standard_plan() -> LoadPlan {
    LoadPlan::new(vec![
        TableSpec::new("orders").with_depends_on(["customers"]),
        TableSpec::new("customers"),
        TableSpec::new("audit_log"),
    ])
    .unwrap()
}

fn customers() -> Dataset {
    Dataset::new()
        .with_column("id", vec![1i64.into(), 2i64.into(), 3i64.into()])
        .unwrap()
        .with_column("name", vec!["Ann".into(), "Bob".into(), "Cy".into()])
        .unwrap()
        .with_column("email", vec!["ann@example.com".into(), Value::Null, "cy@example.com".into()])
        .unwrap()
}

fn standard_datasets() -> DatasetMap {
    let mut datasets = DatasetMap::new();
    datasets.insert("customers".to_string(), customers());
    datasets.insert(
        "orders".to_string(),
        Dataset::new()
            .with_column("id", vec![10i64.into(), 11i64.into()])
            .unwrap()
            .with_column("customer_id", vec![1i64.into(), 2i64.into()])
            .unwrap()
            .with_column("total", vec![Value::Float(9.5), Value::Float(f64::NAN)])
            .unwrap(),
    );
    datasets.insert(
        "audit_log".to_string(),
        Dataset::new()
            .with_column("action", vec!["seed".into()])
            .unwrap(),
    );
    datasets
}

fn log_position(db: &FakeDb, needle: &str) -> usize {
    db.log
        .iter()
        .position(|s| s.contains(needle))
        .unwrap_or_else(|| panic!("statement containing {needle:?} was not executed"))
}

#[test]
fn test_full_recreate_load() {
    let dir = script_dir();
    let mut db = FakeDb::new();

    let result = Loader::new(standard_plan(), options(dir.path()))
        .run(&mut db, &standard_datasets())
        .unwrap();

    assert!(result.ddl_ran());
    assert_eq!(result.tables_loaded(), 3);
    assert_eq!(result.rows_loaded(), 6);
    assert_eq!(
        result.rows_by_table(),
        &BTreeMap::from([
            ("audit.audit_log".to_string(), 1),
            ("core.customers".to_string(), 3),
            ("core.orders".to_string(), 2),
        ])
    );

    // dependencies first, ready tables in declaration order
    let inserted: Vec<&str> = db.insert_batches.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(inserted, vec!["core.customers", "audit.audit_log", "core.orders"]);

    // NaN became NULL
    let orders = db.table("core", "orders").unwrap();
    assert_eq!(orders.column_values("total"), vec![Value::Float(9.5), Value::Null]);

    // sequences follow the loaded ids
    assert_eq!(db.state.sequences["core.customers.id"], Some(3));
    assert_eq!(db.state.sequences["core.orders.id"], Some(11));
    assert_eq!(db.state.sequences["audit.audit_log.id"], None);

    // post-load DDL runs after the inserts, indexes before foreign keys
    let last_insert = log_position(&db, "INSERT INTO core.orders");
    let indexes = log_position(&db, "CREATE INDEX");
    let fks = log_position(&db, "FOREIGN KEY");
    assert!(last_insert < indexes);
    assert!(indexes < fks);
    assert!(fks < log_position(&db, "CREATE FUNCTION core.touch()"));
    assert!(!db.in_transaction());
}

#[test]
fn test_missing_required_column_fails_before_any_write() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    let mut datasets = standard_datasets();
    let without_name = customers().project(&["id".to_string(), "email".to_string()]);
    datasets.insert("customers".to_string(), without_name);

    let err = Loader::new(standard_plan(), options(dir.path()))
        .run(&mut db, &datasets)
        .unwrap_err();

    match err {
        LoadError::Align { table, source } => {
            assert_eq!(table, "core.customers");
            assert_eq!(source, AlignError::MissingRequired(vec!["name".to_string()]));
        }
        other => panic!("expected alignment error, got {other:?}"),
    }
    assert!(db.insert_batches.is_empty());
    assert!(!db.logged("CREATE INDEX"));
}

#[test]
fn test_extra_columns_dropped_when_allowed() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    let mut datasets = standard_datasets();
    let with_extra = customers()
        .with_column("nickname", vec!["a".into(), "b".into(), "c".into()])
        .unwrap();
    datasets.insert("customers".to_string(), with_extra);

    Loader::new(standard_plan(), options(dir.path()))
        .run(&mut db, &datasets)
        .unwrap();

    let table = db.table("core", "customers").unwrap();
    assert_eq!(table.rows.len(), 3);
    assert!(table.rows.iter().all(|row| !row.contains_key("nickname")));
}

#[test]
fn test_extra_columns_rejected_when_strict() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    let mut datasets = standard_datasets();
    let with_extra = customers()
        .with_column("nickname", vec!["a".into(), "b".into(), "c".into()])
        .unwrap();
    datasets.insert("customers".to_string(), with_extra);

    let err = Loader::new(
        standard_plan(),
        LoadOptions {
            drop_extra_columns: false,
            ..options(dir.path())
        },
    )
    .run(&mut db, &datasets)
    .unwrap_err();

    assert!(matches!(
        err,
        LoadError::Align {
            source: AlignError::ExtraColumns(ref cols),
            ..
        } if cols == &vec!["nickname".to_string()]
    ));
    assert!(db.insert_batches.is_empty());
}

#[test]
fn test_column_names_are_trimmed_and_reordered() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    let mut datasets = DatasetMap::new();
    datasets.insert(
        "customers".to_string(),
        Dataset::new()
            .with_column(" email ", vec!["x@example.com".into()])
            .unwrap()
            .with_column("name ", vec!["Xi".into()])
            .unwrap(),
    );

    Loader::new(standard_plan(), options(dir.path()))
        .run(&mut db, &datasets)
        .unwrap();

    let row = &db.table("core", "customers").unwrap().rows[0];
    assert_eq!(row.keys().collect::<Vec<_>>(), vec!["email", "name"]);
    assert_eq!(row["name"], Value::from("Xi"));
}

#[test]
fn test_truncate_without_tables_runs_full_ddl() {
    let dir = script_dir();
    let mut db = FakeDb::new();

    let result = Loader::new(
        standard_plan(),
        LoadOptions {
            reset: ResetMode::Truncate,
            ..options(dir.path())
        },
    )
    .run(&mut db, &standard_datasets())
    .unwrap();

    assert!(result.ddl_ran());
    assert!(!db.logged("TRUNCATE"));
    assert_eq!(result.tables_loaded(), 3);
    assert!(db.logged("CREATE INDEX"));
}

#[test]
fn test_truncate_with_tables_skips_ddl() {
    // no scripts at all: running DDL would fail on the missing files
    let empty = TempDir::new().unwrap();
    let mut db = FakeDb::new()
        .with_table("core", "customers", vec![identity("id"), col("name", false), col("email", true)])
        .with_table("audit", "audit_log", vec![identity("id"), col("action", false)]);
    db.state
        .tables
        .values_mut()
        .next()
        .unwrap()
        .rows
        .push(BTreeMap::from([("action".to_string(), Value::from("stale"))]));

    let result = Loader::new(
        standard_plan(),
        LoadOptions {
            reset: ResetMode::Truncate,
            ..options(empty.path())
        },
    )
    .run(&mut db, &standard_datasets())
    .unwrap();

    assert!(!result.ddl_ran());
    assert!(db.logged(
        "TRUNCATE TABLE \"core\".\"customers\", \"audit\".\"audit_log\" RESTART IDENTITY CASCADE"
    ));
    assert_eq!(
        db.table("audit", "audit_log").unwrap().column_values("action"),
        vec![Value::from("seed")]
    );
    assert_eq!(db.table("core", "customers").unwrap().rows.len(), 3);
    // orders has no table: skipped, not fatal
    assert!(!result.rows_by_table().contains_key("core.orders"));
    assert!(db.state.schemas.contains("ingest"));
}

#[test]
fn test_ddl_only_stops_after_pre_scripts() {
    let dir = script_dir();
    let mut db = FakeDb::new();

    let result = Loader::new(
        standard_plan(),
        LoadOptions {
            ddl_only: true,
            ..options(dir.path())
        },
    )
    .run(&mut db, &standard_datasets())
    .unwrap();

    assert_eq!(result.tables_loaded(), 0);
    assert!(result.rows_by_table().is_empty());
    assert!(db.table("core", "customers").unwrap().rows.is_empty());
    assert!(!db.logged("CREATE INDEX"));
}

#[test]
fn test_absent_and_empty_datasets_are_skipped() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    let mut datasets = DatasetMap::new();
    datasets.insert("customers".to_string(), customers());
    datasets.insert("orders".to_string(), Dataset::new());

    let result = Loader::new(standard_plan(), options(dir.path()))
        .run(&mut db, &datasets)
        .unwrap();

    assert_eq!(result.tables_loaded(), 1);
    assert_eq!(result.rows_loaded(), 3);
}

#[test]
fn test_missing_destination_table_is_skipped() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    let plan = LoadPlan::new(vec![TableSpec::new("customers"), TableSpec::new("ghosts")]).unwrap();
    let mut datasets = standard_datasets();
    datasets.insert(
        "ghosts".to_string(),
        Dataset::new().with_column("id", vec![1i64.into()]).unwrap(),
    );

    let result = Loader::new(plan, options(dir.path()))
        .run(&mut db, &datasets)
        .unwrap();
    assert!(result.rows_by_table().contains_key("core.customers"));
    assert!(!result.rows_by_table().contains_key("core.ghosts"));
}

#[test]
fn test_require_all_datasets_fails_before_database_work() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    let mut datasets = standard_datasets();
    datasets.remove("orders");

    let err = Loader::new(
        standard_plan(),
        LoadOptions {
            require_all_datasets: true,
            ..options(dir.path())
        },
    )
    .run(&mut db, &datasets)
    .unwrap_err();

    assert!(matches!(err, LoadError::Plan(PlanError::MissingDatasets(ref keys)) if keys == &vec!["orders".to_string()]));
    assert!(db.log.is_empty());
}

#[test]
fn test_inserts_are_batched() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    let ids: Vec<Value> = (1..=5i64).map(Value::from).collect();
    let names: Vec<Value> = (1..=5).map(|i| Value::from(format!("c{i}"))).collect();
    let mut datasets = DatasetMap::new();
    datasets.insert(
        "customers".to_string(),
        Dataset::new()
            .with_column("id", ids)
            .unwrap()
            .with_column("name", names)
            .unwrap(),
    );

    Loader::new(
        standard_plan(),
        LoadOptions {
            batch_size: 2,
            ..options(dir.path())
        },
    )
    .run(&mut db, &datasets)
    .unwrap();

    let sizes: Vec<usize> = db.insert_batches.iter().map(|(_, n)| *n).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(db.state.sequences["core.customers.id"], Some(5));
}

#[test]
fn test_zero_batch_size_is_rejected() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    let err = Loader::new(
        standard_plan(),
        LoadOptions {
            batch_size: 0,
            ..options(dir.path())
        },
    )
    .run(&mut db, &standard_datasets())
    .unwrap_err();
    assert!(matches!(err, LoadError::InvalidBatchSize));
    assert!(db.log.is_empty());
}

#[test]
fn test_insert_failure_rolls_back_table_and_aborts() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    db.fail_inserts.insert("core.orders".to_string());

    let err = Loader::new(standard_plan(), options(dir.path()))
        .run(&mut db, &standard_datasets())
        .unwrap_err();

    assert!(matches!(err, LoadError::Database { ref table, .. } if table == "core.orders"));
    assert!(db.table("core", "orders").unwrap().rows.is_empty());
    // earlier tables were committed on their own
    assert_eq!(db.table("core", "customers").unwrap().rows.len(), 3);
    assert!(!db.in_transaction());
}

#[test]
fn test_sequence_errors_are_not_fatal() {
    for code in ["42501", "XX000"] {
        let dir = script_dir();
        let mut db = FakeDb::new();
        db.sequence_error = Some(DbError::with_code(code, "permission denied for sequence"));

        let result = Loader::new(standard_plan(), options(dir.path()))
            .run(&mut db, &standard_datasets())
            .unwrap();
        assert_eq!(result.tables_loaded(), 3);
        assert!(db.state.sequences.is_empty());
    }
}

#[test]
fn test_transforms_run_before_alignment() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    let mut datasets = DatasetMap::new();
    datasets.insert(
        "customers".to_string(),
        Dataset::new()
            .with_column("full_name", vec!["Ann".into()])
            .unwrap(),
    );
    let transforms = TransformRegistry::new().with(
        "customers",
        RenameColumns {
            renames: BTreeMap::from([("full_name".to_string(), "name".to_string())]),
        },
    );

    Loader::new(standard_plan(), options(dir.path()))
        .with_transforms(transforms)
        .run(&mut db, &datasets)
        .unwrap();

    assert_eq!(
        db.table("core", "customers").unwrap().column_values("name"),
        vec![Value::from("Ann")]
    );
    // the caller's dataset is untouched
    assert!(datasets["customers"].column("full_name").is_some());
}

#[test]
fn test_deadline_checked_between_tables() {
    let empty = TempDir::new().unwrap();
    let mut db = FakeDb::new().with_table("core", "customers", vec![identity("id"), col("name", false)]);

    let err = Loader::new(
        standard_plan(),
        LoadOptions {
            reset: ResetMode::Truncate,
            deadline: Some(Instant::now() - Duration::from_millis(1)),
            ..options(empty.path())
        },
    )
    .run(&mut db, &standard_datasets())
    .unwrap_err();

    assert!(matches!(err, LoadError::DeadlineExceeded { ref table } if table == "customers"));
    assert!(db.insert_batches.is_empty());
}

fn fallback_db() -> FakeDb {
    FakeDb::new()
        .with_table("core", "customers", vec![identity("id"), col("name", false)])
        .with_table("core", "notes", vec![col("body", true)])
        .with_table("core", "staff", vec![col("name", true)])
        .with_table("audit", "events", vec![col("what", true)])
}

fn one_column(name: &str, value: &str) -> Dataset {
    Dataset::new().with_column(name, vec![value.into()]).unwrap()
}

#[test]
fn test_fallback_loads_unclaimed_datasets() {
    let empty = TempDir::new().unwrap();
    let mut db = fallback_db();
    let plan = LoadPlan::new(vec![TableSpec::new("customers")]).unwrap();

    let mut datasets = DatasetMap::new();
    datasets.insert("customers".to_string(), one_column("name", "Ann"));
    datasets.insert("notes".to_string(), one_column("body", "hello"));
    datasets.insert("audit.events".to_string(), one_column("what", "seeded"));
    datasets.insert("ghost".to_string(), one_column("x", "boo"));

    let result = Loader::new(
        plan,
        LoadOptions {
            reset: ResetMode::Truncate,
            ..options(empty.path())
        },
    )
    .run(&mut db, &datasets)
    .unwrap();

    assert_eq!(
        result.rows_by_table().keys().collect::<Vec<_>>(),
        vec!["audit.events", "core.customers", "core.notes"]
    );
    assert_eq!(
        db.table("audit", "events").unwrap().column_values("what"),
        vec![Value::from("seeded")]
    );
}

#[test]
fn test_fallback_never_rematches_claimed_keys() {
    let empty = TempDir::new().unwrap();
    let mut db = fallback_db();
    // "notes" is claimed by a skipped spec, "customers" by a spec on another table
    let plan = LoadPlan::new(vec![
        TableSpec::new("notes").with_mode(sql_seed::plan::SpecMode::Skip),
        TableSpec::new("staff").with_dataset_key("customers"),
    ])
    .unwrap();

    let mut datasets = DatasetMap::new();
    datasets.insert("customers".to_string(), one_column("name", "Ann"));
    datasets.insert("notes".to_string(), one_column("body", "hello"));

    let result = Loader::new(
        plan,
        LoadOptions {
            reset: ResetMode::Truncate,
            ..options(empty.path())
        },
    )
    .run(&mut db, &datasets)
    .unwrap();

    assert_eq!(
        result.rows_by_table().keys().collect::<Vec<_>>(),
        vec!["core.staff"]
    );
    assert!(db.table("core", "customers").unwrap().rows.is_empty());
    assert!(db.table("core", "notes").unwrap().rows.is_empty());
}

#[test]
fn test_fallback_failures_do_not_abort_siblings() {
    let empty = TempDir::new().unwrap();
    let mut db = fallback_db();
    db.fail_inserts.insert("core.notes".to_string());
    let plan = LoadPlan::new(Vec::new()).unwrap();

    let mut datasets = DatasetMap::new();
    datasets.insert("audit.events".to_string(), one_column("what", "seeded"));
    datasets.insert("notes".to_string(), one_column("body", "hello"));
    datasets.insert("staff".to_string(), one_column("name", "Bo"));

    let result = Loader::new(
        plan,
        LoadOptions {
            reset: ResetMode::Truncate,
            ..options(empty.path())
        },
    )
    .run(&mut db, &datasets)
    .unwrap();

    assert_eq!(
        result.rows_by_table().keys().collect::<Vec<_>>(),
        vec!["audit.events", "core.staff"]
    );
    assert!(!db.in_transaction());
}

#[test]
fn test_fallback_can_be_disabled() {
    let empty = TempDir::new().unwrap();
    let mut db = fallback_db();
    let mut datasets = DatasetMap::new();
    datasets.insert("notes".to_string(), one_column("body", "hello"));

    let result = Loader::new(
        LoadPlan::new(Vec::new()).unwrap(),
        LoadOptions {
            reset: ResetMode::Truncate,
            fallback_unplanned: false,
            ..options(empty.path())
        },
    )
    .run(&mut db, &datasets)
    .unwrap();
    assert_eq!(result.tables_loaded(), 0);
}

#[test]
fn test_analyze_runs_last() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    Loader::new(
        standard_plan(),
        LoadOptions {
            analyze: true,
            ..options(dir.path())
        },
    )
    .run(&mut db, &standard_datasets())
    .unwrap();
    assert_eq!(db.log.last().map(String::as_str), Some("ANALYZE"));
}

/// Tries to shorten a column, which a dataset must refuse.
struct ShortenColumn;

impl DatasetTransform for ShortenColumn {
    fn apply(&self, mut dataset: Dataset, _ctx: &TransformContext<'_>) -> Result<Dataset, TransformError> {
        dataset.replace_values("name", vec![Value::from("only one")])?;
        Ok(dataset)
    }

    fn name(&self) -> &str {
        "shorten"
    }
}

#[test]
fn test_transform_cannot_make_columns_ragged() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    let transforms = TransformRegistry::new().with("customers", ShortenColumn);

    let err = Loader::new(standard_plan(), options(dir.path()))
        .with_transforms(transforms)
        .run(&mut db, &standard_datasets())
        .unwrap_err();

    assert!(matches!(
        err,
        LoadError::Transform {
            ref table,
            source: TransformError::Dataset(_),
        } if table == "core.customers"
    ));
    assert!(db.insert_batches.is_empty());
    assert!(!db.in_transaction());
}

#[test]
fn test_colliding_trimmed_names_are_rejected() {
    let dir = script_dir();
    let mut db = FakeDb::new();
    let mut datasets = DatasetMap::new();
    datasets.insert(
        "customers".to_string(),
        Dataset::new()
            .with_column("name", vec!["Ann".into()])
            .unwrap()
            .with_column(" name", vec!["Bob".into()])
            .unwrap(),
    );

    let err = Loader::new(standard_plan(), options(dir.path()))
        .run(&mut db, &datasets)
        .unwrap_err();

    assert!(matches!(
        err,
        LoadError::Align {
            source: AlignError::Dataset(_),
            ..
        }
    ));
    assert!(db.insert_batches.is_empty());
}
