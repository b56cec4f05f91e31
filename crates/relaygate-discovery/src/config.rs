use relaygate_core::{ReadPreference, RelaygateError};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SchemaConfig {
    pub name: String,
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct GroupConfig {
    pub name: String,
    pub nodes: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default)]
    pub read_preference: ReadPreference,
    pub algorithm: AlgorithmConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    QuorumReplication,
    HeartbeatLag {
        #[serde(default = "default_max_replication_delay_ms")]
        max_replication_delay_ms: u64,
    },
    VendorMetadata,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

fn default_max_replication_delay_ms() -> u64 {
    10_000
}

impl GroupConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), RelaygateError> {
        if self.nodes.is_empty() {
            return Err(RelaygateError::Config(format!(
                "group {} has no nodes",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.as_str()) {
                return Err(RelaygateError::Config(format!(
                    "group {} lists node {} twice",
                    self.name, node
                )));
            }
        }
        if self.poll_interval_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(RelaygateError::Config(format!(
                "group {} needs a non-zero poll interval and probe timeout",
                self.name
            )));
        }
        Ok(())
    }
}

impl SchemaConfig {
    pub fn validate(&self) -> Result<(), RelaygateError> {
        let mut seen = HashSet::new();
        for group in &self.groups {
            if !seen.insert(group.name.as_str()) {
                return Err(RelaygateError::Config(format!(
                    "schema {} declares group {} twice",
                    self.name, group.name
                )));
            }
            group.validate()?;
        }
        Ok(())
    }
}
