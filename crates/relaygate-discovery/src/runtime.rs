use crate::algorithm::build_algorithm;
use crate::monitor::{ClusterMonitor, CycleOutcome};
use crate::rule::DiscoveryRule;
use relaygate_core::{DataSourceRegistry, RelaygateError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct MonitorHandle {
    monitor: Arc<ClusterMonitor>,
    shutdown: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

/// Owns one cluster monitor per loaded discovery group.
pub struct DiscoveryRuntime {
    rule: Arc<DiscoveryRule>,
    monitors: Mutex<HashMap<(String, String), MonitorHandle>>,
}

impl DiscoveryRuntime {
    /// Build a monitor for every group of `rule`; algorithms are chosen here, once.
    pub fn new(rule: Arc<DiscoveryRule>, registry: Arc<dyn DataSourceRegistry>) -> Self {
        let mut monitors = HashMap::new();
        for (schema, group) in rule.groups() {
            let Some(config) = rule.group_config(&schema, &group) else {
                continue;
            };
            let monitor = Arc::new(ClusterMonitor::new(
                schema.clone(),
                config,
                build_algorithm(&config.algorithm),
                registry.clone(),
                rule.clone(),
            ));
            let (shutdown, _) = broadcast::channel(1);
            monitors.insert(
                (schema, group),
                MonitorHandle {
                    monitor,
                    shutdown,
                    task: None,
                },
            );
        }
        Self {
            rule,
            monitors: Mutex::new(monitors),
        }
    }

    pub fn rule(&self) -> &Arc<DiscoveryRule> {
        &self.rule
    }

    /// Spawn the polling loop of every monitor not yet running.
    pub async fn start(&self) {
        let mut monitors = self.monitors.lock().await;
        for handle in monitors.values_mut() {
            if handle.task.is_some() {
                continue;
            }
            let receiver = handle.shutdown.subscribe();
            let monitor = handle.monitor.clone();
            handle.task = Some(tokio::spawn(monitor.run(receiver)));
        }
        info!(groups = monitors.len(), "discovery runtime started");
    }

    pub async fn monitor(&self, schema: &str, group: &str) -> Option<Arc<ClusterMonitor>> {
        self.monitors
            .lock()
            .await
            .get(&(schema.to_string(), group.to_string()))
            .map(|handle| handle.monitor.clone())
    }

    /// Administrative "rediscover now"; coalesces with a cycle already in flight.
    pub async fn rediscover(&self, schema: &str, group: &str) -> Result<CycleOutcome, RelaygateError> {
        let monitor = self
            .monitor(schema, group)
            .await
            .ok_or_else(|| RelaygateError::UnknownGroup {
                schema: schema.to_string(),
                group: group.to_string(),
            })?;
        Ok(monitor.discover_now().await)
    }

    /// Stop the schema's monitors, then tear its rule state down.
    pub async fn unload_schema(&self, schema: &str) -> bool {
        let handles: Vec<MonitorHandle> = {
            let mut monitors = self.monitors.lock().await;
            let keys: Vec<(String, String)> = monitors
                .keys()
                .filter(|(s, _)| s == schema)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| monitors.remove(key)).collect()
        };
        stop_all(handles).await;
        let unloaded = self.rule.unload(schema);
        if unloaded {
            info!(schema, "schema unloaded");
        }
        unloaded
    }

    pub async fn shutdown(&self) {
        let handles: Vec<MonitorHandle> = {
            let mut monitors = self.monitors.lock().await;
            monitors.drain().map(|(_, handle)| handle).collect()
        };
        stop_all(handles).await;
        info!("discovery runtime stopped");
    }
}

async fn stop_all(handles: Vec<MonitorHandle>) {
    for handle in &handles {
        handle.monitor.cancel();
        let _ = handle.shutdown.send(());
    }
    for handle in handles {
        if let Some(task) = handle.task {
            if let Err(err) = task.await {
                warn!(
                    schema = handle.monitor.schema(),
                    group = handle.monitor.group(),
                    error = %err,
                    "cluster monitor task ended abnormally"
                );
            }
        }
    }
}
