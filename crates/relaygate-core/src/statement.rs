use crate::types::Column;
use serde::Deserialize;

/// Declared kind of a parsed statement; drives execution without inspecting results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Empty,
    Query,
    Insert,
    Update,
    Delete,
    Ddl(String),
    Other(String),
}

impl StatementKind {
    pub fn is_query(&self) -> bool {
        matches!(self, StatementKind::Query)
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, StatementKind::Query | StatementKind::Empty)
    }

    /// Command tag reported on completion, e.g. `UPDATE 5`.
    pub fn command_tag(&self, rows: u64) -> String {
        match self {
            StatementKind::Empty => String::new(),
            StatementKind::Query => format!("SELECT {rows}"),
            StatementKind::Insert => format!("INSERT 0 {rows}"),
            StatementKind::Update => format!("UPDATE {rows}"),
            StatementKind::Delete => format!("DELETE {rows}"),
            StatementKind::Ddl(tag) | StatementKind::Other(tag) => tag.clone(),
        }
    }
}

/// Parsed statement handle, produced by the SQL frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatement {
    pub sql: String,
    pub kind: StatementKind,
    pub param_count: usize,
    /// Parameter type OIDs declared by the client at Parse; 0 leaves inference to the backend.
    pub param_types: Vec<i32>,
    /// Result columns when statically known.
    pub declared_columns: Option<Vec<Column>>,
}

impl ParsedStatement {
    pub fn new(sql: impl Into<String>, kind: StatementKind, param_count: usize) -> Self {
        Self {
            sql: sql.into(),
            kind,
            param_count,
            param_types: Vec::new(),
            declared_columns: None,
        }
    }

    pub fn empty() -> Self {
        Self::new("", StatementKind::Empty, 0)
    }

    pub fn with_param_types(mut self, param_types: Vec<i32>) -> Self {
        self.param_types = param_types;
        self
    }

    pub fn with_columns(mut self, columns: Vec<Column>) -> Self {
        self.declared_columns = Some(columns);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    #[default]
    Primary,
    Replica,
}
