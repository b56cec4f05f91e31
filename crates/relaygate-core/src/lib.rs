pub mod error;
pub mod node;
pub mod registry;
pub mod statement;
pub mod types;

pub use error::RelaygateError;
pub use node::{DataSourceNode, Liveness, NodeRole, ProbeMetadata, ProbeReport};
pub use registry::{Connection, DataSourceRegistry, Execution};
pub use statement::{ParsedStatement, ReadPreference, StatementKind};
pub use types::{Column, DataRow, DataType, DataValue, FormatCode};
