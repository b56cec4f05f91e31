//! Discovery algorithm family.
//!
//! Every variant answers one question per reachable node: is it the primary,
//! a usable replica, or neither. Probing, timeouts and applying the result
//! belong to the cluster monitor, so variants stay pure and synchronous.

use crate::config::AlgorithmConfig;
use relaygate_core::{ProbeMetadata, RelaygateError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Reachable(ProbeMetadata),
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeObservation {
    pub node: String,
    pub observation: Observation,
}

impl NodeObservation {
    pub fn reachable(node: impl Into<String>, metadata: ProbeMetadata) -> Self {
        Self {
            node: node.into(),
            observation: Observation::Reachable(metadata),
        }
    }

    pub fn unreachable(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            observation: Observation::Unreachable(reason.into()),
        }
    }
}

/// Outcome of one discovery cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub primary: Option<String>,
    pub replicas: BTreeSet<String>,
    pub unreachable: BTreeSet<String>,
}

impl ProbeResult {
    pub fn is_indeterminate(&self) -> bool {
        self.primary.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidate {
    Primary,
    Replica,
    /// Reachable but not usable for routing (lagging, recovering, offline member).
    Excluded,
}

pub trait DiscoveryAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    fn classify(&self, node: &str, metadata: &ProbeMetadata) -> Result<Candidate, RelaygateError>;

    fn evaluate(&self, observations: &[NodeObservation]) -> Result<ProbeResult, RelaygateError> {
        let mut result = ProbeResult::default();
        for obs in observations {
            let metadata = match &obs.observation {
                Observation::Reachable(metadata) => metadata,
                Observation::Unreachable(_) => {
                    result.unreachable.insert(obs.node.clone());
                    continue;
                }
            };
            match self.classify(&obs.node, metadata)? {
                Candidate::Primary => {
                    if let Some(existing) = &result.primary {
                        return Err(RelaygateError::Discovery(format!(
                            "{} reports more than one primary: {} and {}",
                            self.name(),
                            existing,
                            obs.node
                        )));
                    }
                    result.primary = Some(obs.node.clone());
                }
                Candidate::Replica => {
                    result.replicas.insert(obs.node.clone());
                }
                Candidate::Excluded => {}
            }
        }
        Ok(result)
    }
}

pub fn build_algorithm(config: &AlgorithmConfig) -> Arc<dyn DiscoveryAlgorithm> {
    match config {
        AlgorithmConfig::QuorumReplication => Arc::new(QuorumReplication),
        AlgorithmConfig::HeartbeatLag {
            max_replication_delay_ms,
        } => Arc::new(HeartbeatLag {
            max_replication_delay: Duration::from_millis(*max_replication_delay_ms),
        }),
        AlgorithmConfig::VendorMetadata => Arc::new(VendorMetadata),
    }
}

/// Election-group replication: members report `member_role` and `member_state`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuorumReplication;

impl DiscoveryAlgorithm for QuorumReplication {
    fn name(&self) -> &'static str {
        "quorum_replication"
    }

    fn classify(&self, node: &str, metadata: &ProbeMetadata) -> Result<Candidate, RelaygateError> {
        let role = required(metadata, node, "member_role")?.to_uppercase();
        let state = required(metadata, node, "member_state")?.to_uppercase();
        if state != "ONLINE" {
            return Ok(Candidate::Excluded);
        }
        match role.as_str() {
            "PRIMARY" => Ok(Candidate::Primary),
            "SECONDARY" => Ok(Candidate::Replica),
            other => Err(RelaygateError::Discovery(format!(
                "{node} reports unknown member_role {other}"
            ))),
        }
    }
}

/// Replication with a lag heartbeat: the writable node is primary, read-only
/// nodes whose delay stays under the limit are replicas.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatLag {
    pub max_replication_delay: Duration,
}

impl DiscoveryAlgorithm for HeartbeatLag {
    fn name(&self) -> &'static str {
        "heartbeat_lag"
    }

    fn classify(&self, node: &str, metadata: &ProbeMetadata) -> Result<Candidate, RelaygateError> {
        let read_only = parse_bool(node, "read_only", required(metadata, node, "read_only")?)?;
        if !read_only {
            return Ok(Candidate::Primary);
        }
        let raw = required(metadata, node, "replication_lag_ms")?;
        let lag_ms: u64 = raw.trim().parse().map_err(|_| {
            RelaygateError::Discovery(format!("{node} reports invalid replication_lag_ms {raw:?}"))
        })?;
        if Duration::from_millis(lag_ms) <= self.max_replication_delay {
            Ok(Candidate::Replica)
        } else {
            Ok(Candidate::Excluded)
        }
    }
}

/// Vendor status view: `local_role` of Primary/Standby with `db_state` Normal.
#[derive(Debug, Clone, Copy, Default)]
pub struct VendorMetadata;

impl DiscoveryAlgorithm for VendorMetadata {
    fn name(&self) -> &'static str {
        "vendor_metadata"
    }

    fn classify(&self, node: &str, metadata: &ProbeMetadata) -> Result<Candidate, RelaygateError> {
        let role = required(metadata, node, "local_role")?.to_lowercase();
        let state = required(metadata, node, "db_state")?.to_lowercase();
        if state != "normal" {
            return Ok(Candidate::Excluded);
        }
        Ok(match role.as_str() {
            "primary" => Candidate::Primary,
            "standby" | "cascade standby" => Candidate::Replica,
            _ => Candidate::Excluded,
        })
    }
}

fn required<'a>(
    metadata: &'a ProbeMetadata,
    node: &str,
    key: &str,
) -> Result<&'a str, RelaygateError> {
    metadata
        .get(key)
        .ok_or_else(|| RelaygateError::Discovery(format!("{node} probe is missing {key}")))
}

fn parse_bool(node: &str, key: &str, raw: &str) -> Result<bool, RelaygateError> {
    match raw.trim().to_lowercase().as_str() {
        "t" | "true" | "on" | "1" | "yes" => Ok(true),
        "f" | "false" | "off" | "0" | "no" => Ok(false),
        _ => Err(RelaygateError::Discovery(format!(
            "{node} reports invalid {key} {raw:?}"
        ))),
    }
}
