use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Primary,
    Replica,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Reachable,
    Unreachable,
}

/// A physical database instance as seen by the last completed discovery cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataSourceNode {
    pub name: String,
    pub liveness: Liveness,
    pub role: NodeRole,
}

impl DataSourceNode {
    pub fn unknown(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            liveness: Liveness::Unreachable,
            role: NodeRole::Unknown,
        }
    }
}

/// Self-reported status of one node, as returned by the probe query
/// (column name to textual value).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeMetadata {
    values: BTreeMap<String, String>,
}

impl ProbeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into().to_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, String)> for ProbeMetadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut metadata = ProbeMetadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub reachable: bool,
    pub metadata: ProbeMetadata,
}

impl ProbeReport {
    pub fn reachable(metadata: ProbeMetadata) -> Self {
        Self {
            reachable: true,
            metadata,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            metadata: ProbeMetadata::new(),
        }
    }
}
