use relaygate_core::{Column, FormatCode, RelaygateError, StatementKind};
use std::collections::HashMap;

/// Messages a client sends to the proxy, and that the proxy itself sends
/// when it talks to a backend node.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    Startup { params: HashMap<String, String> },
    /// Answered with `N`; connections stay in plaintext.
    SslRequest,
    Query { sql: String },
    /// Cleartext password, only ever sent to backends that request it.
    Password { password: String },
    Terminate,
    /// Type byte the proxy does not handle (COPY data, function calls, ...).
    Unsupported { code: u8 },
    Parse {
        statement_name: String,
        query: String,
        /// Declared parameter types, forwarded to the backend's Parse.
        param_oids: Vec<i32>,
    },
    /// Bind triggers dispatch: the portal is routed and executed before
    /// BindComplete goes back to the client.
    Bind {
        portal_name: String,
        statement_name: String,
        param_format_codes: Vec<i16>,
        param_values: Vec<Option<Vec<u8>>>,
        result_format_codes: Vec<i16>,
    },
    Describe {
        target: DescribeTarget,
        name: String,
    },
    /// `max_rows` of 0 streams the rest of the result set.
    Execute {
        portal_name: String,
        max_rows: i32,
    },
    /// Ends the implicit transaction; the client's open portals are released.
    Sync,
    Flush,
    Close {
        target: CloseTarget,
        name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeTarget {
    Statement,
    Portal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTarget {
    Statement,
    Portal,
}

impl DescribeTarget {
    pub fn wire_byte(self) -> u8 {
        match self {
            DescribeTarget::Statement => b'S',
            DescribeTarget::Portal => b'P',
        }
    }
}

impl CloseTarget {
    pub fn wire_byte(self) -> u8 {
        match self {
            CloseTarget::Statement => b'S',
            CloseTarget::Portal => b'P',
        }
    }
}

/// ReadyForQuery status byte. The proxy always reports `Idle` to clients;
/// the other states are only read back from backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Transaction,
    Error,
}

impl TransactionState {
    pub fn wire_byte(self) -> u8 {
        match self {
            TransactionState::Idle => b'I',
            TransactionState::Transaction => b'T',
            TransactionState::Error => b'E',
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(TransactionState::Idle),
            b'T' => Some(TransactionState::Transaction),
            b'E' => Some(TransactionState::Error),
            _ => None,
        }
    }
}

/// Column entry of a RowDescription, sent to clients or read back from a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescriptionField {
    pub name: String,
    pub table_oid: i32,
    pub column_id: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: FormatCode,
}

impl RowDescriptionField {
    pub fn from_column(column: &Column, format: FormatCode) -> Self {
        Self {
            name: column.name.clone(),
            table_oid: 0,
            column_id: 0,
            type_oid: column.data_type.oid(),
            type_size: column.data_type.type_size(),
            type_modifier: -1,
            format,
        }
    }
}

/// Messages sent from the proxy to its client. The executor's response
/// sequence is built from BindComplete, RowDescription, NoData, DataRow,
/// CommandComplete and ErrorResponse.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    ParameterStatus { key: String, value: String },
    BackendKeyData { pid: i32, secret: i32 },
    ReadyForQuery { state: TransactionState },
    ParseComplete,
    BindComplete,
    NoData,
    ParameterDescription { type_oids: Vec<i32> },
    RowDescription { fields: Vec<RowDescriptionField> },
    /// One row; each cell is already encoded in its column's requested format.
    DataRow { values: Vec<Option<Vec<u8>>> },
    CommandComplete { kind: StatementKind, rows: u64 },
    EmptyQueryResponse,
    PortalSuspended,
    ErrorResponse { code: String, message: String },
    CloseComplete,
}

impl BackendMessage {
    pub fn error(err: &RelaygateError) -> Self {
        BackendMessage::ErrorResponse {
            code: err.sqlstate().to_string(),
            message: err.to_string(),
        }
    }
}

/// Split a CommandComplete tag such as `INSERT 0 3` into kind and row count.
pub fn parse_command_tag(tag: &str) -> (StatementKind, u64) {
    let mut words = tag.split_whitespace();
    let verb = words.next().unwrap_or_default().to_uppercase();
    let rows = tag
        .rsplit(' ')
        .next()
        .and_then(|last| last.parse::<u64>().ok());
    let kind = match verb.as_str() {
        "SELECT" if rows.is_some() => StatementKind::Query,
        "INSERT" if rows.is_some() => StatementKind::Insert,
        "UPDATE" if rows.is_some() => StatementKind::Update,
        "DELETE" if rows.is_some() => StatementKind::Delete,
        "CREATE" | "DROP" | "ALTER" | "TRUNCATE" => StatementKind::Ddl(tag.to_string()),
        _ => StatementKind::Other(tag.to_string()),
    };
    (kind, rows.unwrap_or(0))
}
