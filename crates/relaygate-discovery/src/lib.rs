pub mod algorithm;
pub mod config;
pub mod monitor;
pub mod rule;
pub mod runtime;

pub use algorithm::{
    build_algorithm, Candidate, DiscoveryAlgorithm, NodeObservation, Observation, ProbeResult,
};
pub use config::{AlgorithmConfig, GroupConfig, SchemaConfig};
pub use monitor::{ClusterMonitor, CycleOutcome, MonitorState};
pub use rule::{ApplyOutcome, DiscoveryRule, Topology, TopologyEvent};
pub use runtime::DiscoveryRuntime;
