//! Client-facing PostgreSQL frontend.
//!
//! Bind dispatches the portal through the command executor, so BindComplete
//! is only sent once the backend accepted the statement. The initial
//! response is held back and replayed at Describe (RowDescription or NoData)
//! and Execute (CommandComplete). Query rows stay on the backend socket until
//! Execute pulls them. After an error every message up to Sync is discarded.

use crate::sql::parse_statement;
use metrics::counter;
use relaygate_core::{
    DataValue, FormatCode, ParsedStatement, ReadPreference, RelaygateError,
    StatementKind,
};
use relaygate_executor::{FetchResult, Portal, Session};
use relaygate_protocol::backend::{write_message, write_messages};
use relaygate_protocol::frontend::{read_message, read_startup};
use relaygate_protocol::messages::{
    CloseTarget, DescribeTarget, RowDescriptionField, TransactionState,
};
use relaygate_protocol::{BackendMessage, FrontendMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use uuid::Uuid;

const TEXT_OID: i32 = 25;
const ROW_BATCH: usize = 64;

/// Outcome of one client request once the transport itself succeeded.
type Reply = Result<(), RelaygateError>;

/// Initial response of an executed portal, waiting for Describe/Execute.
enum Pending {
    Empty,
    Update(BackendMessage),
    NoRows,
    Rows(BackendMessage),
}

pub struct ClientConnection<S> {
    id: Uuid,
    stream: S,
    session: Session,
    read_preference: ReadPreference,
    statements: HashMap<String, Arc<ParsedStatement>>,
    pending: HashMap<String, Pending>,
    skipping: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ClientConnection<S> {
    pub fn new(stream: S, session: Session, read_preference: ReadPreference) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream,
            session,
            read_preference,
            statements: HashMap::new(),
            pending: HashMap::new(),
            skipping: false,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let result = self.serve().await;
        self.session.close().await;
        debug!(client = %self.id, "client session closed");
        result
    }

    async fn serve(&mut self) -> anyhow::Result<()> {
        if !self.startup().await? {
            return Ok(());
        }
        loop {
            let message = read_message(&mut self.stream).await?;
            if self.skipping && !matches!(message, FrontendMessage::Sync | FrontendMessage::Terminate)
            {
                continue;
            }
            let reply = match message {
                FrontendMessage::Query { sql } => {
                    self.simple_query(&sql).await?;
                    self.ready().await?;
                    continue;
                }
                FrontendMessage::Parse {
                    statement_name,
                    query,
                    param_oids,
                } => self.parse(statement_name, &query, param_oids).await?,
                FrontendMessage::Bind {
                    portal_name,
                    statement_name,
                    param_format_codes,
                    param_values,
                    result_format_codes,
                } => {
                    self.bind(
                        portal_name,
                        &statement_name,
                        &param_format_codes,
                        param_values,
                        &result_format_codes,
                    )
                    .await?
                }
                FrontendMessage::Describe { target, name } => self.describe(target, &name).await?,
                FrontendMessage::Execute {
                    portal_name,
                    max_rows,
                } => self.execute(&portal_name, max_rows).await?,
                FrontendMessage::Close { target, name } => self.close(target, &name).await?,
                FrontendMessage::Sync => {
                    self.skipping = false;
                    // Autocommit: every portal ends with the implicit transaction.
                    self.session.close().await;
                    self.pending.clear();
                    self.ready().await?;
                    continue;
                }
                FrontendMessage::Flush => {
                    self.stream.flush().await?;
                    continue;
                }
                FrontendMessage::Terminate => return Ok(()),
                FrontendMessage::Unsupported { code } => Err(RelaygateError::Protocol(format!(
                    "unsupported message: {}",
                    code as char
                ))),
                other => Err(RelaygateError::Protocol(format!(
                    "unexpected message {other:?}"
                ))),
            };
            self.finish(reply).await?;
        }
    }

    /// Returns false when the client went away before starting up.
    async fn startup(&mut self) -> anyhow::Result<bool> {
        let mut startup = read_startup(&mut self.stream).await?;
        if startup == FrontendMessage::SslRequest {
            self.stream.write_all(b"N").await?;
            self.stream.flush().await?;
            startup = read_startup(&mut self.stream).await?;
        }
        let params = match startup {
            FrontendMessage::Startup { params } => params,
            _ => return Ok(false),
        };
        info!(
            client = %self.id,
            user = params.get("user").map(String::as_str).unwrap_or("unknown"),
            database = params.get("database").map(String::as_str).unwrap_or(""),
            "client connected"
        );
        let key = self.id.as_u128();
        write_messages(
            &mut self.stream,
            [
                BackendMessage::AuthenticationOk,
                BackendMessage::ParameterStatus {
                    key: "server_version".into(),
                    value: "14.0".into(),
                },
                BackendMessage::ParameterStatus {
                    key: "client_encoding".into(),
                    value: "UTF8".into(),
                },
                BackendMessage::BackendKeyData {
                    pid: std::process::id() as i32,
                    secret: key as i32,
                },
            ],
        )
        .await?;
        self.ready().await?;
        Ok(true)
    }

    async fn ready(&mut self) -> anyhow::Result<()> {
        write_message(
            &mut self.stream,
            BackendMessage::ReadyForQuery {
                state: TransactionState::Idle,
            },
        )
        .await
    }

    async fn finish(&mut self, reply: Reply) -> anyhow::Result<()> {
        if let Err(err) = reply {
            counter!("client_error_total", "kind" => err.kind()).increment(1);
            debug!(client = %self.id, error = %err, "request failed");
            self.skipping = true;
            write_message(&mut self.stream, BackendMessage::error(&err)).await?;
        }
        Ok(())
    }

    /// Simple queries report errors inline and do not enter skip-until-Sync mode.
    async fn simple_query(&mut self, sql: &str) -> anyhow::Result<()> {
        let statement = match parse_statement(sql) {
            Ok(statement) => Arc::new(statement),
            Err(err) => return write_message(&mut self.stream, BackendMessage::error(&err)).await,
        };
        let reply = match self.open_portal(String::new(), statement, Vec::new(), Vec::new()).await {
            Ok(()) => {
                if let Some(Pending::Rows(description)) = self.pending.get("") {
                    write_message(&mut self.stream, description.clone()).await?;
                }
                self.execute("", 0).await?
            }
            Err(err) => Err(err),
        };
        self.session.close_portal("").await;
        self.pending.remove("");
        if let Err(err) = reply {
            counter!("client_error_total", "kind" => err.kind()).increment(1);
            write_message(&mut self.stream, BackendMessage::error(&err)).await?;
        }
        Ok(())
    }

    async fn parse(
        &mut self,
        name: String,
        query: &str,
        param_oids: Vec<i32>,
    ) -> anyhow::Result<Reply> {
        let statement = match parse_statement(query) {
            Ok(statement) => statement.with_param_types(param_oids),
            Err(err) => return Ok(Err(err)),
        };
        debug!(client = %self.id, statement = %name, kind = ?statement.kind, params = statement.param_count, "parsed");
        self.statements.insert(name, Arc::new(statement));
        write_message(&mut self.stream, BackendMessage::ParseComplete).await?;
        Ok(Ok(()))
    }

    async fn bind(
        &mut self,
        portal_name: String,
        statement_name: &str,
        param_formats: &[i16],
        param_values: Vec<Option<Vec<u8>>>,
        result_formats: &[i16],
    ) -> anyhow::Result<Reply> {
        let Some(statement) = self.statements.get(statement_name).cloned() else {
            return Ok(Err(RelaygateError::Protocol(format!(
                "prepared statement {statement_name:?} does not exist"
            ))));
        };
        let params = match tag_params(param_formats, param_values) {
            Ok(params) => params,
            Err(err) => return Ok(Err(err)),
        };
        let result_formats = match result_formats
            .iter()
            .map(|code| FormatCode::from_wire(*code))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(formats) => formats,
            Err(err) => return Ok(Err(err)),
        };
        if let Err(err) = self
            .open_portal(portal_name, statement, params, result_formats)
            .await
        {
            return Ok(Err(err));
        }
        write_message(&mut self.stream, BackendMessage::BindComplete).await?;
        Ok(Ok(()))
    }

    /// Bind and execute a portal, holding its initial response back.
    async fn open_portal(
        &mut self,
        name: String,
        statement: Arc<ParsedStatement>,
        params: Vec<DataValue>,
        result_formats: Vec<FormatCode>,
    ) -> Reply {
        let portal = Portal::bind(name.clone(), statement, params, result_formats)?
            .with_read_preference(self.read_preference, None);
        self.session.bind(portal).await;
        let mut messages = self.session.execute(&name).await?.into_iter().skip(1);
        let pending = match messages.next() {
            None => Pending::Empty,
            Some(BackendMessage::NoData) => Pending::NoRows,
            Some(description @ BackendMessage::RowDescription { .. }) => Pending::Rows(description),
            Some(complete) => Pending::Update(complete),
        };
        self.pending.insert(name, pending);
        Ok(())
    }

    async fn describe(&mut self, target: DescribeTarget, name: &str) -> anyhow::Result<Reply> {
        let messages = match target {
            DescribeTarget::Statement => {
                let Some(statement) = self.statements.get(name) else {
                    return Ok(Err(RelaygateError::Protocol(format!(
                        "prepared statement {name:?} does not exist"
                    ))));
                };
                let type_oids = (0..statement.param_count)
                    .map(|i| {
                        statement
                            .param_types
                            .get(i)
                            .copied()
                            .filter(|oid| *oid != 0)
                            .unwrap_or(TEXT_OID)
                    })
                    .collect();
                // Without declared columns the result shape is only known after execution.
                let rows = match &statement.declared_columns {
                    Some(columns) if !columns.is_empty() => BackendMessage::RowDescription {
                        fields: columns
                            .iter()
                            .map(|column| RowDescriptionField::from_column(column, FormatCode::Text))
                            .collect(),
                    },
                    _ => BackendMessage::NoData,
                };
                vec![BackendMessage::ParameterDescription { type_oids }, rows]
            }
            DescribeTarget::Portal => match self.pending.get(name) {
                Some(Pending::Rows(description)) => vec![description.clone()],
                Some(_) => vec![BackendMessage::NoData],
                None => {
                    return Ok(Err(RelaygateError::PortalState(format!(
                        "portal {name:?} does not exist"
                    ))))
                }
            },
        };
        write_messages(&mut self.stream, messages).await?;
        Ok(Ok(()))
    }

    async fn execute(&mut self, name: &str, max_rows: i32) -> anyhow::Result<Reply> {
        let complete = match self.pending.get(name) {
            None => {
                return Ok(Err(RelaygateError::PortalState(format!(
                    "portal {name:?} does not exist"
                ))))
            }
            Some(Pending::Empty) => BackendMessage::EmptyQueryResponse,
            Some(Pending::Update(complete)) => complete.clone(),
            Some(Pending::NoRows) => BackendMessage::CommandComplete {
                kind: StatementKind::Query,
                rows: 0,
            },
            Some(Pending::Rows(_)) => return self.stream_rows(name, max_rows).await,
        };
        write_message(&mut self.stream, complete).await?;
        Ok(Ok(()))
    }

    async fn stream_rows(&mut self, name: &str, max_rows: i32) -> anyhow::Result<Reply> {
        let limit = usize::try_from(max_rows).ok().filter(|n| *n > 0);
        let mut batch = Vec::with_capacity(ROW_BATCH);
        let mut sent = 0usize;
        let outcome = loop {
            if limit.is_some_and(|limit| sent >= limit) {
                break Ok(BackendMessage::PortalSuspended);
            }
            match self.session.fetch_next(name).await {
                Ok(FetchResult::Row(row)) => {
                    batch.push(row);
                    sent += 1;
                    if batch.len() >= ROW_BATCH {
                        write_messages(&mut self.stream, std::mem::take(&mut batch)).await?;
                    }
                }
                Ok(FetchResult::EndOfResults) => {
                    let rows = self.session.portal(name).map_or(0, Portal::rows_fetched);
                    break Ok(BackendMessage::CommandComplete {
                        kind: StatementKind::Query,
                        rows,
                    });
                }
                Err(err) => break Err(err),
            }
        };
        match outcome {
            Ok(last) => {
                batch.push(last);
                write_messages(&mut self.stream, batch).await?;
                Ok(Ok(()))
            }
            Err(err) => {
                write_messages(&mut self.stream, batch).await?;
                Ok(Err(err))
            }
        }
    }

    async fn close(&mut self, target: CloseTarget, name: &str) -> anyhow::Result<Reply> {
        match target {
            CloseTarget::Statement => {
                self.statements.remove(name);
            }
            CloseTarget::Portal => {
                self.session.close_portal(name).await;
                self.pending.remove(name);
            }
        }
        write_message(&mut self.stream, BackendMessage::CloseComplete).await?;
        Ok(Ok(()))
    }
}

/// Tag Bind parameter values with their format codes, which follow the
/// same none / one-for-all / one-per-value rule as result formats. Values
/// go to the backend untouched.
fn tag_params(
    formats: &[i16],
    values: Vec<Option<Vec<u8>>>,
) -> Result<Vec<DataValue>, RelaygateError> {
    let formats = formats
        .iter()
        .map(|code| FormatCode::from_wire(*code))
        .collect::<Result<Vec<_>, _>>()?;
    let formats = FormatCode::resolve(&formats, values.len()).map_err(|_| {
        RelaygateError::Protocol(format!(
            "bind supplied {} parameter formats for {} values",
            formats.len(),
            values.len()
        ))
    })?;
    Ok(values
        .into_iter()
        .zip(formats)
        .map(|(value, format)| DataValue::from_wire(format, value))
        .collect())
}
