//! Cluster monitor.
//!
//! # States
//! ```text
//! Idle → Probing → Applying → Idle
//! ```
//! One monitor per discovery group. A cycle probes every member concurrently,
//! each probe bounded by the group's probe timeout, asks the algorithm for a
//! verdict and hands it to the discovery rule. Only one cycle per group runs
//! at a time; a trigger that arrives while one is in flight is coalesced.

use crate::algorithm::{DiscoveryAlgorithm, NodeObservation};
use crate::config::GroupConfig;
use crate::rule::{ApplyOutcome, DiscoveryRule};
use futures_util::future::join_all;
use metrics::counter;
use relaygate_core::{DataSourceRegistry, RelaygateError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Probing,
    Applying,
}

impl MonitorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => MonitorState::Probing,
            2 => MonitorState::Applying,
            _ => MonitorState::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Applied {
        primary: String,
        generation: u64,
        changed: bool,
    },
    Indeterminate,
    Rejected {
        primary: String,
    },
    Failed {
        reason: String,
    },
    /// Another cycle for the group was already in flight.
    Coalesced,
    /// The monitor was cancelled before the result could be applied.
    Cancelled,
}

pub struct ClusterMonitor {
    schema: String,
    group: String,
    members: Vec<String>,
    poll_interval: Duration,
    probe_timeout: Duration,
    algorithm: Arc<dyn DiscoveryAlgorithm>,
    registry: Arc<dyn DataSourceRegistry>,
    rule: Arc<DiscoveryRule>,
    state: AtomicU8,
    cycle: Mutex<()>,
    cancelled: AtomicBool,
}

/// Resets the monitor to Idle when a cycle ends, including when it is dropped mid-probe.
struct IdleOnDrop<'a>(&'a AtomicU8);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(MonitorState::Idle as u8, Ordering::Release);
    }
}

impl ClusterMonitor {
    pub fn new(
        schema: impl Into<String>,
        config: &GroupConfig,
        algorithm: Arc<dyn DiscoveryAlgorithm>,
        registry: Arc<dyn DataSourceRegistry>,
        rule: Arc<DiscoveryRule>,
    ) -> Self {
        Self {
            schema: schema.into(),
            group: config.name.clone(),
            members: config.nodes.clone(),
            poll_interval: config.poll_interval(),
            probe_timeout: config.probe_timeout(),
            algorithm,
            registry,
            rule,
            state: AtomicU8::new(MonitorState::Idle as u8),
            cycle: Mutex::new(()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn enter(&self, state: MonitorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Run one discovery cycle now, or coalesce with the one in flight.
    pub async fn discover_now(&self) -> CycleOutcome {
        let Ok(_cycle) = self.cycle.try_lock() else {
            debug!(schema = %self.schema, group = %self.group, "discovery already in flight, coalescing");
            return CycleOutcome::Coalesced;
        };
        if self.is_cancelled() {
            return CycleOutcome::Cancelled;
        }
        let _idle = IdleOnDrop(&self.state);
        counter!("discovery_cycle_total", "group" => self.group.clone()).increment(1);

        self.enter(MonitorState::Probing);
        let observations = self.probe_all().await;
        let verdict = self.algorithm.evaluate(&observations);

        // Nothing below awaits, so a cycle is either discarded here or applied whole.
        if self.is_cancelled() {
            debug!(schema = %self.schema, group = %self.group, "monitor cancelled, discarding probe result");
            return CycleOutcome::Cancelled;
        }
        self.enter(MonitorState::Applying);
        let result = match verdict {
            Ok(result) => result,
            Err(err) => return self.cycle_failed(err),
        };
        match self.rule.apply(&self.schema, &self.group, &result) {
            Ok(ApplyOutcome::Applied {
                primary,
                generation,
                changed,
            }) => {
                debug!(schema = %self.schema, group = %self.group, primary = %primary, generation, "discovery cycle applied");
                CycleOutcome::Applied {
                    primary,
                    generation,
                    changed,
                }
            }
            Ok(ApplyOutcome::Retained) => CycleOutcome::Indeterminate,
            Err(RelaygateError::RejectedTopology { primary, .. }) => {
                CycleOutcome::Rejected { primary }
            }
            Err(err) => self.cycle_failed(err),
        }
    }

    fn cycle_failed(&self, err: RelaygateError) -> CycleOutcome {
        counter!("discovery_cycle_failed_total", "group" => self.group.clone()).increment(1);
        warn!(schema = %self.schema, group = %self.group, error = %err, "discovery cycle failed, keeping previous topology");
        let reason = err.to_string();
        self.rule.report_failure(&self.schema, &self.group, &reason);
        CycleOutcome::Failed { reason }
    }

    async fn probe_all(&self) -> Vec<NodeObservation> {
        join_all(self.members.iter().map(|node| self.probe_node(node))).await
    }

    async fn probe_node(&self, node: &str) -> NodeObservation {
        let observation = match time::timeout(self.probe_timeout, self.registry.probe(node)).await {
            Ok(Ok(report)) if report.reachable => {
                return NodeObservation::reachable(node, report.metadata)
            }
            Ok(Ok(_)) => NodeObservation::unreachable(node, "reported unreachable"),
            Ok(Err(err)) => NodeObservation::unreachable(node, err.to_string()),
            Err(_) => NodeObservation::unreachable(
                node,
                format!("probe timed out after {:?}", self.probe_timeout),
            ),
        };
        counter!("discovery_probe_unreachable_total", "node" => node.to_string()).increment(1);
        debug!(schema = %self.schema, group = %self.group, node, observation = ?observation.observation, "node unreachable");
        observation
    }

    /// Poll on the group's interval until `shutdown` fires. A cycle still
    /// probing when shutdown arrives is dropped without applying.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            schema = %self.schema,
            group = %self.group,
            interval_ms = self.poll_interval.as_millis() as u64,
            algorithm = self.algorithm.name(),
            "cluster monitor starting"
        );
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }
            tokio::select! {
                _ = self.discover_now() => {}
                _ = shutdown.recv() => break,
            }
        }
        self.cancel();
        info!(schema = %self.schema, group = %self.group, "cluster monitor stopped");
    }
}
