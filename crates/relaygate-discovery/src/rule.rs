//! Per-schema discovery state consulted by every routing decision.
//!
//! Each group's view is one immutable [`Topology`] behind an `ArcSwap`.
//! `apply` builds a complete replacement from a single probe result and
//! swaps it in, so readers see either the old view or the new one.

use crate::algorithm::ProbeResult;
use crate::config::{GroupConfig, SchemaConfig};
use arc_swap::ArcSwap;
use metrics::counter;
use relaygate_core::{DataSourceNode, Liveness, NodeRole, RelaygateError};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    /// Number of successful cycles applied; zero until the group is ready.
    pub generation: u64,
    pub primary: Option<String>,
    pub replicas: BTreeSet<String>,
    pub unreachable: BTreeSet<String>,
    pub nodes: Vec<DataSourceNode>,
}

impl Topology {
    fn pending(members: &[String]) -> Self {
        Self {
            generation: 0,
            primary: None,
            replicas: BTreeSet::new(),
            unreachable: BTreeSet::new(),
            nodes: members.iter().map(DataSourceNode::unknown).collect(),
        }
    }

    fn from_probe(members: &[String], generation: u64, result: &ProbeResult) -> Self {
        let replicas: BTreeSet<String> = result
            .replicas
            .iter()
            .filter(|name| members.contains(name) && result.primary.as_ref() != Some(*name))
            .cloned()
            .collect();
        let unreachable: BTreeSet<String> = result
            .unreachable
            .iter()
            .filter(|name| members.contains(name))
            .cloned()
            .collect();
        let nodes = members
            .iter()
            .map(|name| {
                let role = if result.primary.as_ref() == Some(name) {
                    NodeRole::Primary
                } else if replicas.contains(name) {
                    NodeRole::Replica
                } else {
                    NodeRole::Unknown
                };
                let liveness = if unreachable.contains(name) {
                    Liveness::Unreachable
                } else {
                    Liveness::Reachable
                };
                DataSourceNode {
                    name: name.clone(),
                    liveness,
                    role,
                }
            })
            .collect();
        Self {
            generation,
            primary: result.primary.clone(),
            replicas,
            unreachable,
            nodes,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.primary.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    PrimaryChanged {
        schema: String,
        group: String,
        previous: Option<String>,
        primary: String,
        generation: u64,
    },
    Degraded {
        schema: String,
        group: String,
    },
    Rejected {
        schema: String,
        group: String,
        primary: String,
    },
    CycleFailed {
        schema: String,
        group: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        primary: String,
        generation: u64,
        changed: bool,
    },
    /// Indeterminate result; the previous topology stays authoritative.
    Retained,
}

struct GroupState {
    config: GroupConfig,
    topology: ArcSwap<Topology>,
}

struct SchemaState {
    groups: HashMap<String, GroupState>,
    unloaded: AtomicBool,
}

pub struct DiscoveryRule {
    schemas: HashMap<String, SchemaState>,
    events: broadcast::Sender<TopologyEvent>,
}

impl DiscoveryRule {
    pub fn build(configs: &[SchemaConfig]) -> Result<Self, RelaygateError> {
        let mut schemas = HashMap::new();
        for schema in configs {
            schema.validate()?;
            let groups = schema
                .groups
                .iter()
                .map(|group| {
                    let state = GroupState {
                        config: group.clone(),
                        topology: ArcSwap::from_pointee(Topology::pending(&group.nodes)),
                    };
                    (group.name.clone(), state)
                })
                .collect();
            let state = SchemaState {
                groups,
                unloaded: AtomicBool::new(false),
            };
            if schemas.insert(schema.name.clone(), state).is_some() {
                return Err(RelaygateError::Config(format!(
                    "schema {} declared twice",
                    schema.name
                )));
            }
        }
        let (events, _) = broadcast::channel(64);
        Ok(Self { schemas, events })
    }

    fn group(&self, schema: &str, group: &str) -> Result<&GroupState, RelaygateError> {
        self.schemas
            .get(schema)
            .filter(|state| !state.unloaded.load(Ordering::Acquire))
            .and_then(|state| state.groups.get(group))
            .ok_or_else(|| RelaygateError::UnknownGroup {
                schema: schema.to_string(),
                group: group.to_string(),
            })
    }

    /// Primary of the group, or `None` while no successful cycle has completed.
    pub fn current_primary(&self, schema: &str, group: &str) -> Option<String> {
        self.group(schema, group)
            .ok()
            .and_then(|state| state.topology.load().primary.clone())
    }

    pub fn topology(&self, schema: &str, group: &str) -> Option<Arc<Topology>> {
        self.group(schema, group)
            .ok()
            .map(|state| state.topology.load_full())
    }

    pub fn group_config(&self, schema: &str, group: &str) -> Option<&GroupConfig> {
        self.group(schema, group).ok().map(|state| &state.config)
    }

    pub fn is_current_primary(&self, schema: &str, group: &str, node: &str) -> bool {
        self.current_primary(schema, group).as_deref() == Some(node)
    }

    /// A replica of the group, `preferred` when it is currently usable.
    pub fn replica(&self, schema: &str, group: &str, preferred: Option<&str>) -> Option<String> {
        let topology = self.topology(schema, group)?;
        if let Some(preferred) = preferred {
            if topology.replicas.contains(preferred) {
                return Some(preferred.to_string());
            }
        }
        topology.replicas.iter().next().cloned()
    }

    /// Loaded (schema, group) pairs in a stable order.
    pub fn groups(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .schemas
            .iter()
            .filter(|(_, state)| !state.unloaded.load(Ordering::Acquire))
            .flat_map(|(schema, state)| {
                state
                    .groups
                    .keys()
                    .map(move |group| (schema.clone(), group.clone()))
            })
            .collect();
        out.sort();
        out
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    /// Replace the group's view with the one described by `result`.
    pub fn apply(
        &self,
        schema: &str,
        group: &str,
        result: &ProbeResult,
    ) -> Result<ApplyOutcome, RelaygateError> {
        let state = self.group(schema, group)?;
        let Some(primary) = result.primary.as_deref() else {
            counter!("discovery_indeterminate_total", "group" => group.to_string()).increment(1);
            warn!(schema, group, unreachable = ?result.unreachable, "discovery indeterminate, keeping previous topology");
            self.publish(TopologyEvent::Degraded {
                schema: schema.to_string(),
                group: group.to_string(),
            });
            return Ok(ApplyOutcome::Retained);
        };
        if !state.config.nodes.iter().any(|node| node == primary) {
            counter!("discovery_rejected_total", "group" => group.to_string()).increment(1);
            warn!(schema, group, primary, "rejecting topology: primary is not a configured node");
            self.publish(TopologyEvent::Rejected {
                schema: schema.to_string(),
                group: group.to_string(),
                primary: primary.to_string(),
            });
            return Err(RelaygateError::RejectedTopology {
                group: group.to_string(),
                primary: primary.to_string(),
            });
        }

        let members = &state.config.nodes;
        let previous = state.topology.rcu(|current| {
            Arc::new(Topology::from_probe(members, current.generation + 1, result))
        });
        let generation = previous.generation + 1;
        let changed = previous.primary.as_deref() != Some(primary);
        if changed {
            counter!("discovery_primary_changed_total", "group" => group.to_string()).increment(1);
            info!(schema, group, previous = ?previous.primary, primary, generation, "primary changed");
            self.publish(TopologyEvent::PrimaryChanged {
                schema: schema.to_string(),
                group: group.to_string(),
                previous: previous.primary.clone(),
                primary: primary.to_string(),
                generation,
            });
        }
        Ok(ApplyOutcome::Applied {
            primary: primary.to_string(),
            generation,
            changed,
        })
    }

    pub fn report_failure(&self, schema: &str, group: &str, reason: &str) {
        self.publish(TopologyEvent::CycleFailed {
            schema: schema.to_string(),
            group: group.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Tear the schema down: reads return not-found and `apply` is rejected.
    pub fn unload(&self, schema: &str) -> bool {
        match self.schemas.get(schema) {
            Some(state) => !state.unloaded.swap(true, Ordering::AcqRel),
            None => false,
        }
    }

    fn publish(&self, event: TopologyEvent) {
        let _ = self.events.send(event);
    }
}
