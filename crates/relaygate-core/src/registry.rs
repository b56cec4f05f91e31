use crate::error::RelaygateError;
use crate::node::ProbeReport;
use crate::statement::ParsedStatement;
use crate::types::{Column, DataRow, DataValue, FormatCode};
use async_trait::async_trait;

/// Named handles to physical database instances.
#[async_trait]
pub trait DataSourceRegistry: Send + Sync {
    /// Borrow a connection to `node`, exclusively owned until dropped or closed.
    async fn get(&self, node: &str) -> Result<Box<dyn Connection>, RelaygateError>;

    /// Issue the read-only status probe against `node`.
    async fn probe(&self, node: &str) -> Result<ProbeReport, RelaygateError>;
}

/// Outcome of dispatching one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Update { rows_affected: u64 },
    /// Result set opened; rows are pulled with [`Connection::next_row`].
    Rows { columns: Vec<Column> },
}

#[async_trait]
pub trait Connection: Send {
    fn node(&self) -> &str;

    /// Dispatch `statement`. `result_formats` are the client's Bind codes and
    /// are passed on so cells come back already in the requested encoding.
    async fn execute(
        &mut self,
        statement: &ParsedStatement,
        params: &[DataValue],
        result_formats: &[FormatCode],
    ) -> Result<Execution, RelaygateError>;

    /// Next row of the open result set, `None` once exhausted. Each cell is
    /// tagged with the format the backend sent it in.
    async fn next_row(&mut self) -> Result<Option<DataRow>, RelaygateError>;

    /// Release the backend cursor and the connection.
    async fn close(&mut self) -> Result<(), RelaygateError>;
}
