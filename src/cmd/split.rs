use anyhow::Context;
use serde::Serialize;
use sql_seed::splitter::{split_statements, Statement};
use std::fs;
use std::path::PathBuf;

const EXCERPT_CHARS: usize = 72;

#[derive(Serialize)]
struct SplitJsonOutput<'a> {
    file: String,
    statements: &'a [Statement],
}

pub fn run(file: PathBuf, full: bool, json: bool) -> anyhow::Result<()> {
    let text = fs::read_to_string(&file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let statements = split_statements(&text);

    if json {
        let output = SplitJsonOutput {
            file: file.display().to_string(),
            statements: &statements,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}: {} statements\n", file.display(), statements.len());
    for (i, stmt) in statements.iter().enumerate() {
        let marker = if stmt.is_meta_command() { " (psql meta-command, skipped)" } else { "" };
        if full {
            println!("-- #{} line {}{}\n{}\n", i + 1, stmt.start_line, marker, stmt.sql);
        } else {
            let one_line = stmt.sql.split_whitespace().collect::<Vec<_>>().join(" ");
            println!(
                "  {:>4}  line {:>5}  {}{}",
                i + 1,
                stmt.start_line,
                sql_seed::splitter::excerpt(&one_line, EXCERPT_CHARS),
                marker
            );
        }
    }
    Ok(())
}
