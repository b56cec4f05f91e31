use relaygate_core::{
    Column, Connection, DataRow, DataValue, FormatCode, ParsedStatement, ReadPreference,
    RelaygateError,
};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Query,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PortalState {
    Bound,
    /// Empty statement acknowledged without dispatch.
    Empty,
    Completed,
    NoData,
    Streaming,
    Exhausted,
    Failed(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Row(DataRow),
    EndOfResults,
}

/// A bound, executable statement and its pending result cursor.
pub struct Portal {
    name: String,
    statement: Arc<ParsedStatement>,
    params: Vec<DataValue>,
    result_formats: Vec<FormatCode>,
    read_preference: ReadPreference,
    preferred_replica: Option<String>,
    pub(crate) state: PortalState,
    pub(crate) columns: Vec<Column>,
    pub(crate) formats: Vec<FormatCode>,
    pub(crate) connection: Option<Box<dyn Connection>>,
    pub(crate) backend: Option<String>,
    rows_fetched: u64,
}

impl Portal {
    /// Bind parameter values to a parsed statement. Fails before any backend
    /// work when the value count differs from the declared parameter count.
    pub fn bind(
        name: impl Into<String>,
        statement: Arc<ParsedStatement>,
        params: Vec<DataValue>,
        result_formats: Vec<FormatCode>,
    ) -> Result<Self, RelaygateError> {
        if params.len() != statement.param_count {
            return Err(RelaygateError::BindingArity {
                expected: statement.param_count,
                actual: params.len(),
            });
        }
        Ok(Self {
            name: name.into(),
            statement,
            params,
            result_formats,
            read_preference: ReadPreference::Primary,
            preferred_replica: None,
            state: PortalState::Bound,
            columns: Vec::new(),
            formats: Vec::new(),
            connection: None,
            backend: None,
            rows_fetched: 0,
        })
    }

    pub fn with_read_preference(
        mut self,
        read_preference: ReadPreference,
        preferred_replica: Option<String>,
    ) -> Self {
        self.read_preference = read_preference;
        self.preferred_replica = preferred_replica;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn statement(&self) -> &ParsedStatement {
        &self.statement
    }

    pub fn params(&self) -> &[DataValue] {
        &self.params
    }

    pub fn result_formats(&self) -> &[FormatCode] {
        &self.result_formats
    }

    pub fn read_preference(&self) -> ReadPreference {
        self.read_preference
    }

    pub fn preferred_replica(&self) -> Option<&str> {
        self.preferred_replica.as_deref()
    }

    /// Node the portal was dispatched to.
    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows_fetched(&self) -> u64 {
        self.rows_fetched
    }

    pub fn is_executed(&self) -> bool {
        !matches!(self.state, PortalState::Bound)
    }

    pub fn response_type(&self) -> Option<ResponseType> {
        match self.state {
            PortalState::Completed => Some(ResponseType::Update),
            PortalState::NoData | PortalState::Streaming | PortalState::Exhausted => {
                Some(ResponseType::Query)
            }
            _ => None,
        }
    }

    /// Pull the next row from the backend cursor. Once the result set is
    /// exhausted every further call returns `EndOfResults`.
    pub async fn fetch_next(&mut self) -> Result<Fetched, RelaygateError> {
        match &self.state {
            PortalState::Streaming => {}
            PortalState::Exhausted | PortalState::Empty => return Ok(Fetched::EndOfResults),
            PortalState::Bound => {
                return Err(RelaygateError::PortalState(format!(
                    "portal {:?} has not been executed",
                    self.name
                )))
            }
            PortalState::NoData | PortalState::Completed => {
                return Err(RelaygateError::PortalState(format!(
                    "portal {:?} has no query to stream",
                    self.name
                )))
            }
            PortalState::Failed(reason) => {
                return Err(RelaygateError::PortalState(format!(
                    "portal {:?} is unusable: {reason}",
                    self.name
                )))
            }
            PortalState::Closed => {
                return Err(RelaygateError::PortalState(format!(
                    "portal {:?} is closed",
                    self.name
                )))
            }
        }
        let Some(connection) = self.connection.as_mut() else {
            let err = RelaygateError::ConnectionLost("backend connection released".into());
            self.fail(&err);
            return Err(err);
        };
        match connection.next_row().await {
            Ok(Some(row)) => {
                self.rows_fetched += 1;
                Ok(Fetched::Row(row))
            }
            Ok(None) => {
                self.state = PortalState::Exhausted;
                self.release().await;
                Ok(Fetched::EndOfResults)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Mark the portal unusable and drop its backend connection.
    pub(crate) fn fail(&mut self, err: &RelaygateError) {
        self.state = PortalState::Failed(err.to_string());
        self.connection = None;
    }

    /// Return the borrowed connection once its result set is done.
    pub(crate) async fn release(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(err) = connection.close().await {
                warn!(portal = %self.name, node = connection.node(), error = %err, "closing backend connection failed");
            }
        }
    }

    /// Close the portal and release its cursor; idempotent.
    pub async fn close(&mut self) {
        self.release().await;
        self.state = PortalState::Closed;
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        if let Some(connection) = &self.connection {
            debug!(portal = %self.name, node = connection.node(), "portal dropped with open cursor, releasing connection");
        }
    }
}
