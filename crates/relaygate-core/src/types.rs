use crate::error::RelaygateError;
use serde::{Deserialize, Serialize};

/// A parameter or result cell exactly as it travels on the wire.
///
/// The bytes are whatever the sender produced in the tagged format. They are
/// forwarded untouched and only re-encoded when the other format is asked for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataValue {
    Null,
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

/// Column type tag, keyed by PostgreSQL pg_type OID.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Bytea,
    Int8,
    Int2,
    Int4,
    Text,
    Float4,
    Float8,
    Varchar,
    Other(i32),
}

impl DataType {
    pub fn oid(self) -> i32 {
        match self {
            DataType::Bool => 16,
            DataType::Bytea => 17,
            DataType::Int8 => 20,
            DataType::Int2 => 21,
            DataType::Int4 => 23,
            DataType::Text => 25,
            DataType::Float4 => 700,
            DataType::Float8 => 701,
            DataType::Varchar => 1043,
            DataType::Other(oid) => oid,
        }
    }

    pub fn from_oid(oid: i32) -> Self {
        match oid {
            16 => DataType::Bool,
            17 => DataType::Bytea,
            20 => DataType::Int8,
            21 => DataType::Int2,
            23 => DataType::Int4,
            25 => DataType::Text,
            700 => DataType::Float4,
            701 => DataType::Float8,
            1043 => DataType::Varchar,
            other => DataType::Other(other),
        }
    }

    /// Map an SQL type name to a type tag. Unknown names map to text.
    pub fn from_name(name: &str) -> Self {
        let upper = name.to_uppercase();
        let s = upper.trim();
        match s {
            "INT" | "INTEGER" | "INT4" => DataType::Int4,
            "BIGINT" | "INT8" => DataType::Int8,
            "SMALLINT" | "INT2" => DataType::Int2,
            "BOOLEAN" | "BOOL" => DataType::Bool,
            "FLOAT" | "FLOAT4" | "REAL" => DataType::Float4,
            "DOUBLE" | "FLOAT8" | "DOUBLE PRECISION" => DataType::Float8,
            "BYTEA" => DataType::Bytea,
            "VARCHAR" => DataType::Varchar,
            _ if s.starts_with("CHARACTER VARYING") => DataType::Varchar,
            _ => DataType::Text,
        }
    }

    /// Fixed wire width in bytes, or -1 for variable-length types.
    pub fn type_size(self) -> i16 {
        match self {
            DataType::Bool => 1,
            DataType::Int2 => 2,
            DataType::Int4 | DataType::Float4 => 4,
            DataType::Int8 | DataType::Float8 => 8,
            _ => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRow {
    pub values: Vec<DataValue>,
}

impl DataRow {
    pub fn new(values: Vec<DataValue>) -> Self {
        Self { values }
    }
}

/// Encoding requested for a parameter or result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FormatCode {
    #[default]
    Text,
    Binary,
}

impl FormatCode {
    pub fn from_wire(code: i16) -> Result<Self, RelaygateError> {
        match code {
            0 => Ok(FormatCode::Text),
            1 => Ok(FormatCode::Binary),
            other => Err(RelaygateError::Protocol(format!(
                "invalid format code: {other}"
            ))),
        }
    }

    pub fn wire(self) -> i16 {
        match self {
            FormatCode::Text => 0,
            FormatCode::Binary => 1,
        }
    }

    /// Expand Bind format codes to one per column: none means text, a single
    /// code applies to every column, otherwise there must be one per column.
    pub fn resolve(requested: &[FormatCode], columns: usize) -> Result<Vec<Self>, RelaygateError> {
        match requested.len() {
            0 => Ok(vec![FormatCode::Text; columns]),
            1 => Ok(vec![requested[0]; columns]),
            n if n == columns => Ok(requested.to_vec()),
            n => Err(RelaygateError::Protocol(format!(
                "bind supplied {n} formats for {columns} columns"
            ))),
        }
    }
}

impl DataValue {
    pub fn text(value: impl Into<String>) -> Self {
        DataValue::Text(value.into().into_bytes())
    }

    /// Wrap a cell read off the wire in the format it was sent with.
    pub fn from_wire(format: FormatCode, cell: Option<Vec<u8>>) -> Self {
        match (format, cell) {
            (_, None) => DataValue::Null,
            (FormatCode::Text, Some(bytes)) => DataValue::Text(bytes),
            (FormatCode::Binary, Some(bytes)) => DataValue::Binary(bytes),
        }
    }

    /// Format of a non-null value.
    pub fn format(&self) -> Option<FormatCode> {
        match self {
            DataValue::Null => None,
            DataValue::Text(_) => Some(FormatCode::Text),
            DataValue::Binary(_) => Some(FormatCode::Binary),
        }
    }

    pub fn into_wire(self) -> Option<Vec<u8>> {
        match self {
            DataValue::Null => None,
            DataValue::Text(bytes) | DataValue::Binary(bytes) => Some(bytes),
        }
    }

    /// Cell bytes in `format` for a column of `data_type`, without the length
    /// prefix. Bytes already in `format` are returned verbatim; conversion is
    /// limited to types whose encodings are lossless in both directions.
    pub fn encode(
        self,
        format: FormatCode,
        data_type: DataType,
    ) -> Result<Option<Vec<u8>>, RelaygateError> {
        match (self, format) {
            (DataValue::Null, _) => Ok(None),
            (DataValue::Text(bytes), FormatCode::Text)
            | (DataValue::Binary(bytes), FormatCode::Binary) => Ok(Some(bytes)),
            (DataValue::Text(bytes), FormatCode::Binary) => {
                text_to_binary(&bytes, data_type).map(Some)
            }
            (DataValue::Binary(bytes), FormatCode::Text) => {
                binary_to_text(&bytes, data_type).map(Some)
            }
        }
    }
}

fn text_to_binary(raw: &[u8], data_type: DataType) -> Result<Vec<u8>, RelaygateError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| RelaygateError::Protocol(format!("invalid utf-8 cell: {e}")))?;
    let invalid = |reason: &dyn std::fmt::Display| {
        RelaygateError::Protocol(format!("invalid {data_type:?} value {text:?}: {reason}"))
    };
    match data_type {
        DataType::Bool => match text {
            "t" | "true" => Ok(vec![1]),
            "f" | "false" => Ok(vec![0]),
            _ => Err(invalid(&"expected t or f")),
        },
        DataType::Int2 => text
            .parse::<i16>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| invalid(&e)),
        DataType::Int4 => text
            .parse::<i32>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| invalid(&e)),
        DataType::Int8 => text
            .parse::<i64>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| invalid(&e)),
        DataType::Float4 => text
            .parse::<f32>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| invalid(&e)),
        DataType::Float8 => text
            .parse::<f64>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| invalid(&e)),
        DataType::Bytea => decode_bytea_hex(text).ok_or_else(|| invalid(&"expected \\x hex")),
        DataType::Text | DataType::Varchar => Ok(raw.to_vec()),
        DataType::Other(oid) => Err(RelaygateError::Protocol(format!(
            "no binary encoding for type oid {oid}"
        ))),
    }
}

fn binary_to_text(raw: &[u8], data_type: DataType) -> Result<Vec<u8>, RelaygateError> {
    let width = |expected: usize| {
        if raw.len() == expected {
            Ok(())
        } else {
            Err(RelaygateError::Protocol(format!(
                "binary {data_type:?} value must be {expected} bytes, got {}",
                raw.len()
            )))
        }
    };
    let text = match data_type {
        DataType::Bool => {
            width(1)?;
            (if raw[0] != 0 { "t" } else { "f" }).to_string()
        }
        DataType::Int2 => {
            width(2)?;
            i16::from_be_bytes([raw[0], raw[1]]).to_string()
        }
        DataType::Int4 => {
            width(4)?;
            i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]).to_string()
        }
        DataType::Int8 => {
            width(8)?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(raw);
            i64::from_be_bytes(bytes).to_string()
        }
        DataType::Bytea => encode_bytea_hex(raw),
        DataType::Text | DataType::Varchar => return Ok(raw.to_vec()),
        // Float text output depends on server settings such as extra_float_digits.
        DataType::Float4 | DataType::Float8 | DataType::Other(_) => {
            return Err(RelaygateError::Protocol(format!(
                "cannot render binary type oid {} as text",
                data_type.oid()
            )))
        }
    };
    Ok(text.into_bytes())
}

fn encode_bytea_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn decode_bytea_hex(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}
