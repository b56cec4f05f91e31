use relaygate_core::{ParsedStatement, RelaygateError, StatementKind};
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

/// Statements that change transaction or session state. Every statement runs
/// on its own backend connection in autocommit mode, so none of them can be honoured.
const SESSION_STATE_TAGS: &[&str] = &[
    "BEGIN", "START", "COMMIT", "END", "ROLLBACK", "ABORT", "SAVEPOINT", "RELEASE", "SET",
    "RESET", "DISCARD",
];

/// Classify one client statement and count its `$n` placeholders.
///
/// Statements the parser does not understand are still forwarded; they are
/// classified from their leading keyword. Transaction control and session
/// settings are refused.
pub fn parse_statement(sql: &str) -> Result<ParsedStatement, RelaygateError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Ok(ParsedStatement::empty());
    }
    let kind = match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) if statements.len() > 1 => {
            return Err(RelaygateError::Protocol(
                "cannot insert multiple commands into a prepared statement".into(),
            ))
        }
        Ok(statements) => match statements.first() {
            Some(statement) => classify(statement),
            None => return Ok(ParsedStatement::empty()),
        },
        Err(err) => {
            debug!(error = %err, "statement not understood by parser, classifying by keyword");
            classify_keyword(trimmed)
        }
    };
    if let StatementKind::Other(tag) = &kind {
        if SESSION_STATE_TAGS.contains(&tag.as_str()) {
            return Err(RelaygateError::Unsupported(format!(
                "{tag} (statements run in autocommit mode)"
            )));
        }
    }
    Ok(ParsedStatement::new(sql, kind, placeholder_count(sql)))
}

fn classify(statement: &Statement) -> StatementKind {
    match statement {
        Statement::Query(_)
        | Statement::Explain { .. }
        | Statement::ExplainTable { .. }
        | Statement::ShowVariable { .. } => StatementKind::Query,
        Statement::Insert { .. } => StatementKind::Insert,
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete { .. } => StatementKind::Delete,
        Statement::CreateTable { .. } => StatementKind::Ddl("CREATE TABLE".into()),
        Statement::CreateIndex { .. } => StatementKind::Ddl("CREATE INDEX".into()),
        Statement::CreateView { .. } => StatementKind::Ddl("CREATE VIEW".into()),
        Statement::CreateSchema { .. } => StatementKind::Ddl("CREATE SCHEMA".into()),
        Statement::AlterTable { .. } => StatementKind::Ddl("ALTER TABLE".into()),
        Statement::Drop { object_type, .. } => StatementKind::Ddl(format!("DROP {object_type}")),
        Statement::Truncate { .. } => StatementKind::Ddl("TRUNCATE TABLE".into()),
        Statement::StartTransaction { .. } => StatementKind::Other("BEGIN".into()),
        Statement::Commit { .. } => StatementKind::Other("COMMIT".into()),
        Statement::Rollback { .. } => StatementKind::Other("ROLLBACK".into()),
        Statement::SetVariable { .. } => StatementKind::Other("SET".into()),
        other => classify_keyword(&other.to_string()),
    }
}

fn classify_keyword(sql: &str) -> StatementKind {
    let keyword = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();
    match keyword.as_str() {
        "SELECT" | "WITH" | "SHOW" | "VALUES" | "TABLE" | "EXPLAIN" => StatementKind::Query,
        "INSERT" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => StatementKind::Ddl(keyword),
        _ => StatementKind::Other(keyword),
    }
}

/// Highest `$n` marker outside literals, quoted identifiers and comments.
pub fn placeholder_count(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => i = skip_quoted(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map_or(bytes.len(), |p| i + p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = find(bytes, i + 2, b"*/").map_or(bytes.len(), |p| p + 2);
            }
            b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start {
                    if let Ok(n) = sql[start..end].parse::<usize>() {
                        max = max.max(n);
                    }
                    i = end;
                } else {
                    i = skip_dollar_quoted(bytes, i);
                }
            }
            _ => i += 1,
        }
    }
    max
}

fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Skip `$tag$ ... $tag$`; a lone `$` is stepped over.
fn skip_dollar_quoted(bytes: &[u8], start: usize) -> usize {
    let mut end = start + 1;
    while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
        end += 1;
    }
    if bytes.get(end) != Some(&b'$') {
        return start + 1;
    }
    let tag = &bytes[start..=end];
    find(bytes, end + 1, tag).map_or(bytes.len(), |p| p + tag.len())
}

fn find(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}
