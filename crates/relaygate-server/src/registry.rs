//! Data source registry over the PostgreSQL wire protocol.
//!
//! Probes use a short-lived connection and the simple-query protocol. Borrowed
//! connections run each statement through the unnamed extended-protocol portal
//! and leave the rows on the socket until the executor pulls them.

use crate::config::DataSourceConfig;
use async_trait::async_trait;
use relaygate_core::{
    Column, Connection, DataRow, DataSourceRegistry, DataType, DataValue, Execution, FormatCode,
    ParsedStatement, ProbeMetadata, ProbeReport, RelaygateError,
};
use relaygate_protocol::backend::read_backend_message;
use relaygate_protocol::frontend::write_frontend_message;
use relaygate_protocol::messages::DescribeTarget;
use relaygate_protocol::{BackendMessage, FrontendMessage};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, warn};

pub struct PgRegistry {
    sources: HashMap<String, DataSourceConfig>,
}

impl PgRegistry {
    pub fn new(sources: &[DataSourceConfig]) -> Self {
        Self {
            sources: sources
                .iter()
                .map(|source| (source.name.clone(), source.clone()))
                .collect(),
        }
    }

    fn source(&self, node: &str) -> Result<&DataSourceConfig, RelaygateError> {
        self.sources
            .get(node)
            .ok_or_else(|| RelaygateError::Config(format!("unknown data source {node}")))
    }

    async fn connect(
        &self,
        source: &DataSourceConfig,
    ) -> Result<PgConnection<TcpStream>, RelaygateError> {
        let stream = time::timeout(source.connect_timeout(), TcpStream::connect(&source.addr))
            .await
            .map_err(|_| {
                RelaygateError::ConnectionLost(format!(
                    "connect to {} ({}) timed out",
                    source.name, source.addr
                ))
            })?
            .map_err(|e| {
                RelaygateError::ConnectionLost(format!(
                    "connect to {} ({}): {e}",
                    source.name, source.addr
                ))
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(node = %source.name, error = %err, "set_nodelay failed");
        }
        PgConnection::handshake(
            stream,
            &source.name,
            &source.user,
            &source.database,
            source.password.as_deref(),
        )
        .await
    }
}

#[async_trait]
impl DataSourceRegistry for PgRegistry {
    async fn get(&self, node: &str) -> Result<Box<dyn Connection>, RelaygateError> {
        let source = self.source(node)?;
        Ok(Box::new(self.connect(source).await?))
    }

    async fn probe(&self, node: &str) -> Result<ProbeReport, RelaygateError> {
        let source = self.source(node)?;
        let probe_failed = |err: RelaygateError| RelaygateError::ProbeFailed {
            node: node.to_string(),
            reason: err.to_string(),
        };
        let mut connection = self.connect(source).await.map_err(probe_failed)?;
        let metadata = connection.simple_query_row(&source.probe_query).await;
        if let Err(err) = connection.close().await {
            debug!(node, error = %err, "closing probe connection failed");
        }
        Ok(ProbeReport::reachable(metadata.map_err(probe_failed)?))
    }
}

pub struct PgConnection<S> {
    node: String,
    stream: S,
    columns: Vec<Column>,
    formats: Vec<FormatCode>,
    streaming: bool,
    closed: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> PgConnection<S> {
    /// Run startup and authentication until the backend is ready for queries.
    pub async fn handshake(
        stream: S,
        node: &str,
        user: &str,
        database: &str,
        password: Option<&str>,
    ) -> Result<Self, RelaygateError> {
        let mut connection = Self {
            node: node.to_string(),
            stream,
            columns: Vec::new(),
            formats: Vec::new(),
            streaming: false,
            closed: false,
        };
        let params = HashMap::from([
            ("user".to_string(), user.to_string()),
            ("database".to_string(), database.to_string()),
            ("application_name".to_string(), "relaygate".to_string()),
        ]);
        connection
            .send(&[FrontendMessage::Startup { params }])
            .await?;
        loop {
            match connection.recv().await? {
                BackendMessage::AuthenticationOk
                | BackendMessage::ParameterStatus { .. }
                | BackendMessage::BackendKeyData { .. } => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = password.ok_or_else(|| {
                        RelaygateError::Config(format!("data source {node} requires a password"))
                    })?;
                    connection
                        .send(&[FrontendMessage::Password {
                            password: password.to_string(),
                        }])
                        .await?;
                }
                BackendMessage::ErrorResponse { code, message } => {
                    return Err(RelaygateError::Backend { code, message })
                }
                BackendMessage::ReadyForQuery { .. } => return Ok(connection),
                other => {
                    return Err(RelaygateError::Protocol(format!(
                        "unexpected {other:?} during startup of {node}"
                    )))
                }
            }
        }
    }

    /// Run `sql` with the simple-query protocol and return its first row
    /// keyed by column name.
    pub async fn simple_query_row(&mut self, sql: &str) -> Result<ProbeMetadata, RelaygateError> {
        self.send(&[FrontendMessage::Query {
            sql: sql.to_string(),
        }])
        .await?;
        let mut names = Vec::new();
        let mut first_row = None;
        let mut failure = None;
        loop {
            match self.recv().await? {
                BackendMessage::RowDescription { fields } => {
                    names = fields.into_iter().map(|field| field.name).collect();
                }
                BackendMessage::DataRow { values } if first_row.is_none() => {
                    first_row = Some(values);
                }
                BackendMessage::ErrorResponse { code, message } => {
                    failure = Some(RelaygateError::Backend { code, message });
                }
                BackendMessage::ReadyForQuery { .. } => break,
                _ => {}
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        let values = first_row.ok_or_else(|| {
            RelaygateError::Protocol(format!("probe query on {} returned no rows", self.node))
        })?;
        Ok(names
            .into_iter()
            .zip(values)
            .filter_map(|(name, value)| {
                value.map(|bytes| (name, String::from_utf8_lossy(&bytes).into_owned()))
            })
            .collect())
    }

    async fn send(&mut self, messages: &[FrontendMessage]) -> Result<(), RelaygateError> {
        for message in messages {
            write_frontend_message(&mut self.stream, message)
                .await
                .map_err(|e| self.lost(e))?;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<BackendMessage, RelaygateError> {
        match read_backend_message(&mut self.stream).await {
            Ok(message) => Ok(message),
            Err(err) => {
                self.streaming = false;
                Err(self.lost(err))
            }
        }
    }

    fn lost(&self, err: anyhow::Error) -> RelaygateError {
        RelaygateError::ConnectionLost(format!("{}: {err}", self.node))
    }

    async fn wait_ready(&mut self) -> Result<(), RelaygateError> {
        loop {
            if let BackendMessage::ReadyForQuery { .. } = self.recv().await? {
                return Ok(());
            }
        }
    }

    fn decode_row(&self, values: Vec<Option<Vec<u8>>>) -> Result<DataRow, RelaygateError> {
        if values.len() != self.columns.len() {
            return Err(RelaygateError::Protocol(format!(
                "{} sent {} cells for {} columns",
                self.node,
                values.len(),
                self.columns.len()
            )));
        }
        Ok(DataRow::new(
            values
                .into_iter()
                .zip(&self.formats)
                .map(|(cell, format)| DataValue::from_wire(*format, cell))
                .collect(),
        ))
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection for PgConnection<S> {
    fn node(&self) -> &str {
        &self.node
    }

    async fn execute(
        &mut self,
        statement: &ParsedStatement,
        params: &[DataValue],
        result_formats: &[FormatCode],
    ) -> Result<Execution, RelaygateError> {
        if self.streaming {
            return Err(RelaygateError::PortalState(format!(
                "connection to {} already has an open result set",
                self.node
            )));
        }
        self.send(&[
            FrontendMessage::Parse {
                statement_name: String::new(),
                query: statement.sql.clone(),
                param_oids: statement.param_types.clone(),
            },
            FrontendMessage::Bind {
                portal_name: String::new(),
                statement_name: String::new(),
                param_format_codes: params
                    .iter()
                    .map(|param| param.format().unwrap_or_default().wire())
                    .collect(),
                param_values: params.iter().cloned().map(DataValue::into_wire).collect(),
                result_format_codes: result_formats.iter().map(|format| format.wire()).collect(),
            },
            FrontendMessage::Describe {
                target: DescribeTarget::Portal,
                name: String::new(),
            },
            FrontendMessage::Execute {
                portal_name: String::new(),
                max_rows: 0,
            },
            FrontendMessage::Sync,
        ])
        .await?;
        loop {
            match self.recv().await? {
                BackendMessage::ParseComplete | BackendMessage::BindComplete | BackendMessage::NoData => {}
                BackendMessage::RowDescription { fields } => {
                    self.formats = fields.iter().map(|field| field.format).collect();
                    self.columns = fields
                        .into_iter()
                        .map(|field| Column::new(field.name, DataType::from_oid(field.type_oid)))
                        .collect();
                    self.streaming = true;
                    return Ok(Execution::Rows {
                        columns: self.columns.clone(),
                    });
                }
                BackendMessage::CommandComplete { rows, .. } => {
                    self.wait_ready().await?;
                    return Ok(Execution::Update {
                        rows_affected: rows,
                    });
                }
                BackendMessage::EmptyQueryResponse => {
                    self.wait_ready().await?;
                    return Ok(Execution::Update { rows_affected: 0 });
                }
                BackendMessage::ErrorResponse { code, message } => {
                    self.wait_ready().await?;
                    return Err(RelaygateError::Backend { code, message });
                }
                BackendMessage::ParameterStatus { .. } => {}
                other => {
                    return Err(RelaygateError::Protocol(format!(
                        "unexpected {other:?} from {} during execute",
                        self.node
                    )))
                }
            }
        }
    }

    async fn next_row(&mut self) -> Result<Option<DataRow>, RelaygateError> {
        if !self.streaming {
            return Ok(None);
        }
        match self.recv().await? {
            BackendMessage::DataRow { values } => self.decode_row(values).map(Some),
            BackendMessage::CommandComplete { .. } | BackendMessage::PortalSuspended => {
                self.streaming = false;
                self.wait_ready().await?;
                Ok(None)
            }
            BackendMessage::ErrorResponse { code, message } => {
                self.streaming = false;
                self.wait_ready().await?;
                Err(RelaygateError::Backend { code, message })
            }
            other => Err(RelaygateError::Protocol(format!(
                "unexpected {other:?} from {} while streaming",
                self.node
            ))),
        }
    }

    async fn close(&mut self) -> Result<(), RelaygateError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.streaming {
            warn!(node = %self.node, "closing connection with unread rows");
        }
        self.send(&[FrontendMessage::Terminate]).await?;
        self.stream
            .shutdown()
            .await
            .map_err(|e| RelaygateError::ConnectionLost(format!("{}: {e}", self.node)))
    }
}
