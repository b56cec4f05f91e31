use relaygate_discovery::SchemaConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub admin: AdminConfig,
    pub data_sources: Vec<DataSourceConfig>,
    pub schemas: Vec<SchemaConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub max_connections: usize,
    /// Schema served to clients; the first configured schema when unset.
    pub schema: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    pub listen_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataSourceConfig {
    pub name: String,
    pub addr: String,
    pub user: String,
    pub database: String,
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    pub probe_query: String,
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

impl DataSourceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Config {
    pub fn from_path(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.max_connections == 0 {
            return Err(anyhow::anyhow!("server.max_connections must be positive"));
        }
        let mut sources = HashSet::new();
        for source in &self.data_sources {
            if !sources.insert(source.name.as_str()) {
                return Err(anyhow::anyhow!(format!(
                    "data source {} declared twice",
                    source.name
                )));
            }
            if source.connect_timeout_ms == 0 {
                return Err(anyhow::anyhow!(format!(
                    "data source {} has a zero connect_timeout_ms",
                    source.name
                )));
            }
        }
        if self.schemas.is_empty() {
            return Err(anyhow::anyhow!("no schemas configured"));
        }
        let mut schemas = HashSet::new();
        for schema in &self.schemas {
            if !schemas.insert(schema.name.as_str()) {
                return Err(anyhow::anyhow!(format!(
                    "schema {} declared twice",
                    schema.name
                )));
            }
            schema.validate()?;
            for group in &schema.groups {
                if let Some(node) = group.nodes.iter().find(|n| !sources.contains(n.as_str())) {
                    return Err(anyhow::anyhow!(format!(
                        "group {}.{} names unknown data source {node}",
                        schema.name, group.name
                    )));
                }
            }
        }
        self.frontend_target()?;
        Ok(())
    }

    /// The (schema, group) pair the client frontend routes to.
    pub fn frontend_target(&self) -> anyhow::Result<(String, String)> {
        let schema = match &self.server.schema {
            Some(name) => self
                .schemas
                .iter()
                .find(|s| &s.name == name)
                .ok_or_else(|| anyhow::anyhow!(format!("server.schema {name} is not configured")))?,
            None => self
                .schemas
                .first()
                .ok_or_else(|| anyhow::anyhow!("no schemas configured"))?,
        };
        let group = match &self.server.group {
            Some(name) => schema
                .groups
                .iter()
                .find(|g| &g.name == name)
                .ok_or_else(|| {
                    anyhow::anyhow!(format!(
                        "server.group {name} is not a group of schema {}",
                        schema.name
                    ))
                })?,
            None => schema
                .groups
                .first()
                .ok_or_else(|| anyhow::anyhow!(format!("schema {} has no groups", schema.name)))?,
        };
        Ok((schema.name.clone(), group.name.clone()))
    }
}
