//! Extended-protocol command execution against the discovered topology.
//!
//! `execute` routes a bound portal, dispatches it once and returns the
//! initial response. Query rows are not buffered; the caller pulls them one
//! at a time through `fetch_next`.

use crate::portal::{Fetched, Portal, PortalState, ResponseType};
use metrics::counter;
use relaygate_core::{
    Column, DataRow, DataSourceRegistry, Execution, FormatCode, ReadPreference, RelaygateError,
    StatementKind,
};
use relaygate_discovery::DiscoveryRule;
use relaygate_protocol::messages::RowDescriptionField;
use relaygate_protocol::BackendMessage;
use std::sync::Arc;
use tracing::{debug, warn};

/// SQLSTATE a demoted primary answers writes with.
const READ_ONLY_SQL_TRANSACTION: &str = "25006";

#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    /// A `DataRow` message in the portal's result formats.
    Row(BackendMessage),
    EndOfResults,
}

struct Route {
    node: String,
    primary: bool,
}

pub struct CommandExecutor {
    rule: Arc<DiscoveryRule>,
    registry: Arc<dyn DataSourceRegistry>,
    schema: String,
    group: String,
}

impl CommandExecutor {
    pub fn new(
        rule: Arc<DiscoveryRule>,
        registry: Arc<dyn DataSourceRegistry>,
        schema: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            rule,
            registry,
            schema: schema.into(),
            group: group.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Dispatch the portal's statement and return its initial response.
    ///
    /// Routing failures and stale-topology rejections leave the portal bound
    /// and untouched so the caller may retry; any other error fails it.
    pub async fn execute(&self, portal: &mut Portal) -> Result<Vec<BackendMessage>, RelaygateError> {
        if portal.is_executed() {
            return Err(RelaygateError::PortalState(format!(
                "portal {:?} was already executed",
                portal.name()
            )));
        }
        let kind = portal.statement().kind.clone();
        if kind == StatementKind::Empty {
            portal.state = PortalState::Empty;
            return Ok(vec![BackendMessage::BindComplete]);
        }
        counter!("portal_execute_total", "group" => self.group.clone()).increment(1);

        let route = self.route(portal)?;
        let mut connection = match self.registry.get(&route.node).await {
            Ok(connection) => connection,
            Err(err) => {
                self.check_stale(&route)?;
                portal.fail(&err);
                return Err(err);
            }
        };
        self.check_stale(&route)?;

        debug!(
            schema = %self.schema,
            group = %self.group,
            node = %route.node,
            portal = portal.name(),
            kind = ?kind,
            "dispatching portal"
        );
        let execution = match connection
            .execute(portal.statement(), portal.params(), portal.result_formats())
            .await
        {
            Ok(execution) => execution,
            Err(RelaygateError::Backend { code, .. })
                if code == READ_ONLY_SQL_TRANSACTION && route.primary =>
            {
                warn!(node = %route.node, group = %self.group, "write rejected as read-only, topology is stale");
                return Err(self.stale(&route.node));
            }
            Err(err) => {
                counter!("portal_execute_error_total", "group" => self.group.clone()).increment(1);
                portal.fail(&err);
                return Err(err);
            }
        };
        portal.backend = Some(route.node);
        portal.connection = Some(connection);

        match (kind.is_query(), execution) {
            (false, Execution::Update { rows_affected }) => {
                portal.state = PortalState::Completed;
                portal.release().await;
                Ok(vec![
                    BackendMessage::BindComplete,
                    BackendMessage::CommandComplete {
                        kind,
                        rows: rows_affected,
                    },
                ])
            }
            // Writes with a result set (RETURNING) still complete as an update.
            (false, Execution::Rows { .. }) => {
                let rows = self.drain(portal).await?;
                portal.state = PortalState::Completed;
                portal.release().await;
                Ok(vec![
                    BackendMessage::BindComplete,
                    BackendMessage::CommandComplete { kind, rows },
                ])
            }
            (true, Execution::Update { .. }) => {
                portal.state = PortalState::NoData;
                portal.release().await;
                Ok(vec![BackendMessage::BindComplete, BackendMessage::NoData])
            }
            (true, Execution::Rows { columns }) if columns.is_empty() => {
                portal.state = PortalState::NoData;
                portal.release().await;
                Ok(vec![BackendMessage::BindComplete, BackendMessage::NoData])
            }
            (true, Execution::Rows { columns }) => {
                let formats = match FormatCode::resolve(portal.result_formats(), columns.len()) {
                    Ok(formats) => formats,
                    Err(err) => {
                        portal.fail(&err);
                        return Err(err);
                    }
                };
                let fields = columns
                    .iter()
                    .zip(&formats)
                    .map(|(column, format)| RowDescriptionField::from_column(column, *format))
                    .collect();
                portal.columns = columns;
                portal.formats = formats;
                portal.state = PortalState::Streaming;
                Ok(vec![
                    BackendMessage::BindComplete,
                    BackendMessage::RowDescription { fields },
                ])
            }
        }
    }

    /// Pull one row from an executed query portal.
    pub async fn fetch_next(&self, portal: &mut Portal) -> Result<FetchResult, RelaygateError> {
        match portal.fetch_next().await {
            Ok(Fetched::Row(row)) => {
                counter!("portal_rows_fetched_total", "group" => self.group.clone()).increment(1);
                match encode_row(row, &portal.columns, &portal.formats) {
                    Ok(values) => Ok(FetchResult::Row(BackendMessage::DataRow { values })),
                    Err(err) => {
                        portal.fail(&err);
                        Err(err)
                    }
                }
            }
            Ok(Fetched::EndOfResults) => Ok(FetchResult::EndOfResults),
            Err(err) => {
                if matches!(err, RelaygateError::ConnectionLost(_)) {
                    warn!(portal = portal.name(), node = ?portal.backend(), error = %err, "backend lost mid-stream");
                }
                Err(err)
            }
        }
    }

    pub fn response_type(&self, portal: &Portal) -> Option<ResponseType> {
        portal.response_type()
    }

    fn route(&self, portal: &Portal) -> Result<Route, RelaygateError> {
        if portal.statement().kind.is_query() && portal.read_preference() == ReadPreference::Replica
        {
            if let Some(node) =
                self.rule
                    .replica(&self.schema, &self.group, portal.preferred_replica())
            {
                return Ok(Route {
                    node,
                    primary: false,
                });
            }
        }
        match self.rule.current_primary(&self.schema, &self.group) {
            Some(node) => Ok(Route {
                node,
                primary: true,
            }),
            None => Err(RelaygateError::RoutingUnavailable {
                schema: self.schema.clone(),
                group: self.group.clone(),
            }),
        }
    }

    fn check_stale(&self, route: &Route) -> Result<(), RelaygateError> {
        if route.primary && !self.rule.is_current_primary(&self.schema, &self.group, &route.node) {
            return Err(self.stale(&route.node));
        }
        Ok(())
    }

    fn stale(&self, node: &str) -> RelaygateError {
        RelaygateError::StaleTopology {
            group: self.group.clone(),
            node: node.to_string(),
        }
    }

    async fn drain(&self, portal: &mut Portal) -> Result<u64, RelaygateError> {
        portal.state = PortalState::Streaming;
        let mut rows = 0;
        while let Fetched::Row(_) = portal.fetch_next().await? {
            rows += 1;
        }
        Ok(rows)
    }
}

/// Cells the backend already sent in the negotiated format pass through as is.
fn encode_row(
    row: DataRow,
    columns: &[Column],
    formats: &[FormatCode],
) -> Result<Vec<Option<Vec<u8>>>, RelaygateError> {
    if row.values.len() != columns.len() {
        return Err(RelaygateError::Protocol(format!(
            "backend row has {} values for {} columns",
            row.values.len(),
            columns.len()
        )));
    }
    row.values
        .into_iter()
        .zip(columns.iter().zip(formats))
        .map(|(value, (column, format))| value.encode(*format, column.data_type))
        .collect()
}
