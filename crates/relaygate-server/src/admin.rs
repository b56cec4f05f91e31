use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use relaygate_core::RelaygateError;
use relaygate_discovery::{CycleOutcome, DiscoveryRuntime, Topology};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AdminState {
    runtime: Arc<DiscoveryRuntime>,
    metrics: PrometheusHandle,
}

impl AdminState {
    pub fn new(runtime: Arc<DiscoveryRuntime>, metrics: PrometheusHandle) -> Self {
        Self { runtime, metrics }
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ready", get(ready))
        .route("/metrics", get(render_metrics))
        .route("/topology", get(topology))
        .route("/discovery/:schema/:group", post(rediscover))
        .with_state(state)
}

/// Ready once every loaded group has completed a successful discovery cycle.
pub(crate) async fn ready(State(state): State<AdminState>) -> (StatusCode, &'static str) {
    let rule = state.runtime.rule();
    let all_ready = rule.groups().iter().all(|(schema, group)| {
        rule.topology(schema, group)
            .is_some_and(|topology| topology.is_ready())
    });
    if all_ready {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "discovery pending")
    }
}

async fn render_metrics(State(state): State<AdminState>) -> String {
    state.metrics.render()
}

pub(crate) async fn topology(
    State(state): State<AdminState>,
) -> Json<BTreeMap<String, BTreeMap<String, Topology>>> {
    let rule = state.runtime.rule();
    let mut out: BTreeMap<String, BTreeMap<String, Topology>> = BTreeMap::new();
    for (schema, group) in rule.groups() {
        if let Some(topology) = rule.topology(&schema, &group) {
            out.entry(schema)
                .or_default()
                .insert(group, topology.as_ref().clone());
        }
    }
    Json(out)
}

pub(crate) async fn rediscover(
    State(state): State<AdminState>,
    Path((schema, group)): Path<(String, String)>,
) -> Result<Json<CycleOutcome>, (StatusCode, Json<Value>)> {
    match state.runtime.rediscover(&schema, &group).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(err @ RelaygateError::UnknownGroup { .. }) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": err.to_string() })),
        )),
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )),
    }
}
