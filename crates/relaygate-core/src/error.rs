use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelaygateError {
    #[error("probe of {node} failed: {reason}")]
    ProbeFailed { node: String, reason: String },
    #[error("discovery error: {0}")]
    Discovery(String),
    #[error("rejected topology for group {group}: primary {primary} is not a configured node")]
    RejectedTopology { group: String, primary: String },
    #[error("unknown discovery group {schema}.{group}")]
    UnknownGroup { schema: String, group: String },
    #[error("no primary known for {schema}.{group}")]
    RoutingUnavailable { schema: String, group: String },
    #[error("stale topology: {node} is no longer primary of {group}")]
    StaleTopology { group: String, node: String },
    #[error("{message}")]
    Backend { code: String, message: String },
    #[error("bind supplies {actual} parameters, but statement requires {expected}")]
    BindingArity { expected: usize, actual: usize },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("portal error: {0}")]
    PortalState(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("not supported: {0}")]
    Unsupported(String),
}

impl RelaygateError {
    /// Routing failures that a caller may retry against a fresh topology read.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelaygateError::RoutingUnavailable { .. } | RelaygateError::StaleTopology { .. }
        )
    }

    pub fn sqlstate(&self) -> &str {
        match self {
            RelaygateError::Backend { code, .. } => code,
            RelaygateError::BindingArity { .. } => "08P01",
            RelaygateError::ConnectionLost(_) => "08006",
            RelaygateError::RoutingUnavailable { .. } => "08001",
            RelaygateError::StaleTopology { .. } => "40001",
            RelaygateError::PortalState(_) => "34000",
            RelaygateError::Protocol(_) => "08P01",
            RelaygateError::UnknownGroup { .. } => "3D000",
            RelaygateError::Unsupported(_) => "0A000",
            RelaygateError::ProbeFailed { .. }
            | RelaygateError::Discovery(_)
            | RelaygateError::RejectedTopology { .. }
            | RelaygateError::Config(_) => "XX000",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelaygateError::ProbeFailed { .. } => "probe_failed",
            RelaygateError::Discovery(_) => "discovery",
            RelaygateError::RejectedTopology { .. } => "rejected_topology",
            RelaygateError::UnknownGroup { .. } => "unknown_group",
            RelaygateError::RoutingUnavailable { .. } => "routing_unavailable",
            RelaygateError::StaleTopology { .. } => "stale_topology",
            RelaygateError::Backend { .. } => "backend",
            RelaygateError::BindingArity { .. } => "binding_arity",
            RelaygateError::ConnectionLost(_) => "connection_lost",
            RelaygateError::PortalState(_) => "portal_state",
            RelaygateError::Protocol(_) => "protocol",
            RelaygateError::Config(_) => "config",
            RelaygateError::Unsupported(_) => "unsupported",
        }
    }
}
