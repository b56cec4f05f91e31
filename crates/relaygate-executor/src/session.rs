use crate::executor::{CommandExecutor, FetchResult};
use crate::portal::Portal;
use metrics::counter;
use relaygate_core::RelaygateError;
use relaygate_protocol::BackendMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Named portals of one client connection.
///
/// Dropping the session drops every portal, which releases any backend
/// connection a suspended cursor still holds.
pub struct Session {
    executor: Arc<CommandExecutor>,
    portals: HashMap<String, Portal>,
}

impl Session {
    pub fn new(executor: Arc<CommandExecutor>) -> Self {
        Self {
            executor,
            portals: HashMap::new(),
        }
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Register a bound portal, replacing any portal of the same name.
    pub async fn bind(&mut self, portal: Portal) {
        if let Some(mut previous) = self.portals.remove(portal.name()) {
            previous.close().await;
        }
        self.portals.insert(portal.name().to_string(), portal);
    }

    pub fn portal(&self, name: &str) -> Option<&Portal> {
        self.portals.get(name)
    }

    /// Execute a portal. A stale-topology rejection is retried once against
    /// the refreshed primary.
    pub async fn execute(&mut self, name: &str) -> Result<Vec<BackendMessage>, RelaygateError> {
        let portal = self.portals.get_mut(name).ok_or_else(|| unknown_portal(name))?;
        match self.executor.execute(portal).await {
            Err(RelaygateError::StaleTopology { group, node }) => {
                counter!("routing_stale_retry_total", "group" => group.clone()).increment(1);
                debug!(portal = name, group = %group, node = %node, "retrying on refreshed topology");
                self.executor.execute(portal).await
            }
            other => other,
        }
    }

    pub async fn fetch_next(&mut self, name: &str) -> Result<FetchResult, RelaygateError> {
        let portal = self.portals.get_mut(name).ok_or_else(|| unknown_portal(name))?;
        self.executor.fetch_next(portal).await
    }

    /// Close a portal; closing an unknown portal is not an error.
    pub async fn close_portal(&mut self, name: &str) -> bool {
        match self.portals.remove(name) {
            Some(mut portal) => {
                portal.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every open portal.
    pub async fn close(&mut self) {
        for (name, mut portal) in self.portals.drain() {
            if portal.backend().is_some() {
                debug!(portal = %name, "closing portal at session end");
            }
            portal.close().await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.portals.is_empty() {
            warn!(portals = self.portals.len(), "session dropped with open portals");
        }
    }
}

fn unknown_portal(name: &str) -> RelaygateError {
    RelaygateError::PortalState(format!("portal {name:?} does not exist"))
}
