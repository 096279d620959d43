//! Statement splitter for SQL scripts.
//!
//! Turns the raw text of a `.sql` file into executable statements:
//! - Single-quoted strings (with `''` escapes) and double-quoted identifiers
//! - `--` line comments and `/* */` block comments (no nesting)
//! - PostgreSQL dollar-quoted bodies (`$$ ... $$`, `$fn$ ... $fn$`)
//! - psql meta-command lines (`\set`, `\i`), emitted as their own statements
//! - 1-based start line tracking for diagnostics
//!
//! The splitter only finds statement boundaries; it does not interpret SQL.

use serde::Serialize;

/// A single executable SQL unit and where it starts in the source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statement {
    /// Statement text, from its first code character through the terminating `;`
    pub sql: String,
    /// 1-based line of the first code character
    pub start_line: usize,
}

impl Statement {
    /// Client-side meta-commands (`\connect`, `\i`, ...) cannot be sent to the server.
    pub fn is_meta_command(&self) -> bool {
        self.sql.starts_with('\\')
    }

    /// First `max_chars` characters of the statement, for logs and error messages.
    pub fn excerpt(&self, max_chars: usize) -> String {
        excerpt(&self.sql, max_chars)
    }
}

/// Truncate `sql` to at most `max_chars` characters, marking the cut with `...`.
pub fn excerpt(sql: &str, max_chars: usize) -> String {
    match sql.char_indices().nth(max_chars) {
        Some((pos, _)) => format!("{}...", &sql[..pos]),
        None => sql.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment,
    /// Inside a dollar-quoted block; the tag is `sql[start..start + len]`
    DollarQuote { start: usize, len: usize },
}

/// Split a SQL script into statements.
///
/// A `;` ends a statement only in normal scanning state. Leading whitespace and
/// comments are not part of a statement, so comment-only chunks produce nothing.
/// Text after the last `;` is flushed as a final statement if it contains code,
/// including unterminated dollar quotes or block comments.
pub fn split_statements(sql: &str) -> Vec<Statement> {
    let sql = sql.strip_prefix('\u{feff}').unwrap_or(sql);
    let bytes = sql.as_bytes();
    let n = bytes.len();

    let mut out = Vec::new();
    let mut state = ScanState::Normal;
    let mut line = 1usize;
    // (byte offset, line) of the first code character of the pending statement
    let mut code_start: Option<(usize, usize)> = None;
    let mut i = 0;

    while i < n {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();

        if b == b'\n' {
            line += 1;
        }

        match state {
            ScanState::LineComment => {
                if b == b'\n' {
                    state = ScanState::Normal;
                }
                i += 1;
            }
            ScanState::BlockComment => {
                if b == b'*' && next == Some(b'/') {
                    state = ScanState::Normal;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            ScanState::DollarQuote { start, len } => {
                if b == b'$' && bytes[i..].starts_with(&bytes[start..start + len]) {
                    state = ScanState::Normal;
                    i += len;
                } else {
                    i += 1;
                }
            }
            ScanState::SingleQuote => {
                if b == b'\'' {
                    if next == Some(b'\'') {
                        i += 2;
                        continue;
                    }
                    state = ScanState::Normal;
                }
                i += 1;
            }
            ScanState::DoubleQuote => {
                if b == b'"' {
                    state = ScanState::Normal;
                }
                i += 1;
            }
            ScanState::Normal => {
                if b == b'-' && next == Some(b'-') {
                    state = ScanState::LineComment;
                    i += 2;
                    continue;
                }
                if b == b'/' && next == Some(b'*') {
                    state = ScanState::BlockComment;
                    i += 2;
                    continue;
                }
                if b == b';' {
                    if let Some((start, start_line)) = code_start.take() {
                        push_statement(&mut out, &sql[start..=i], start_line);
                    }
                    i += 1;
                    continue;
                }
                if b.is_ascii_whitespace() {
                    i += 1;
                    continue;
                }

                if code_start.is_none() {
                    // psql meta-commands end at the newline, not at `;`
                    if b == b'\\' {
                        let end = sql[i..].find('\n').map_or(n, |p| i + p);
                        push_statement(&mut out, &sql[i..end], line);
                        i = end;
                        continue;
                    }
                    code_start = Some((i, line));
                }

                match b {
                    b'\'' => {
                        state = ScanState::SingleQuote;
                        i += 1;
                    }
                    b'"' => {
                        state = ScanState::DoubleQuote;
                        i += 1;
                    }
                    b'$' => match dollar_tag_len(bytes, i) {
                        Some(len) => {
                            state = ScanState::DollarQuote { start: i, len };
                            i += len;
                        }
                        None => i += 1,
                    },
                    _ => i += 1,
                }
            }
        }
    }

    if let Some((start, start_line)) = code_start {
        push_statement(&mut out, &sql[start..], start_line);
    }

    out
}

fn push_statement(out: &mut Vec<Statement>, text: &str, start_line: usize) {
    let text = text.trim_end();
    if text.trim_matches(|c: char| c == ';' || c.is_whitespace()).is_empty() {
        return;
    }
    out.push(Statement {
        sql: text.to_string(),
        start_line,
    });
}

/// Length of the dollar-quote tag opening at `pos` (`$$` or `$tag$`), if any.
///
/// Tags follow PostgreSQL's rules: identifier characters, not starting with a
/// digit, and the opening `$` must not continue an identifier (`a$b$` is a name).
fn dollar_tag_len(bytes: &[u8], pos: usize) -> Option<usize> {
    if pos > 0 && is_ident_byte(bytes[pos - 1]) {
        return None;
    }
    let mut j = pos + 1;
    if j < bytes.len() && bytes[j].is_ascii_digit() {
        return None;
    }
    while j < bytes.len() && is_ident_byte(bytes[j]) {
        j += 1;
    }
    if j < bytes.len() && bytes[j] == b'$' {
        Some(j + 1 - pos)
    } else {
        None
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}
