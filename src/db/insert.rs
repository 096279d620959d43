//! Literal multi-row INSERT rendering.

use super::{quote_ident, QualifiedName};
use crate::dataset::Value;

/// Render one value as a SQL literal.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(x) if x.is_finite() => {
            let s = x.to_string();
            // keep floats typed as numeric, not integer
            if s.contains(['.', 'e', 'E']) {
                s
            } else {
                format!("{}.0", s)
            }
        }
        Value::Float(_) => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Timestamp(ts) => format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S%.f")),
    }
}

/// Generate a batched INSERT statement for `rows` laid out as `columns`.
///
/// Returns an empty string when there is nothing to insert.
pub fn render_insert(target: &QualifiedName, columns: &[String], rows: &[Vec<Value>]) -> String {
    if rows.is_empty() || columns.is_empty() {
        return String::new();
    }

    let mut sql = format!("INSERT INTO {} (", target.quoted());
    for (i, col) in columns.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&quote_ident(col));
    }
    sql.push_str(") VALUES\n");

    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            sql.push_str(",\n");
        }
        sql.push('(');
        for (j, value) in row.iter().enumerate() {
            if j > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&render_value(value));
        }
        sql.push(')');
    }

    sql
}
