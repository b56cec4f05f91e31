use crate::admin::{self, AdminState};
use crate::config::Config;
use crate::frontend::ClientConnection;
use crate::registry::PgRegistry;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use relaygate_core::DataSourceRegistry;
use relaygate_discovery::{DiscoveryRule, DiscoveryRuntime};
use relaygate_executor::{CommandExecutor, Session};
use relaygate_protocol::backend::write_message;
use relaygate_protocol::BackendMessage;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

pub async fn run(config: Config) -> anyhow::Result<()> {
    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    let rule = Arc::new(DiscoveryRule::build(&config.schemas)?);
    let registry: Arc<dyn DataSourceRegistry> = Arc::new(PgRegistry::new(&config.data_sources));
    let runtime = Arc::new(DiscoveryRuntime::new(rule.clone(), registry.clone()));
    runtime.start().await;

    let admin_listener = TcpListener::bind(&config.admin.listen_addr).await?;
    info!(addr = %config.admin.listen_addr, "admin endpoint listening");
    let app = admin::router(AdminState::new(runtime.clone(), metrics_handle));
    tokio::spawn(async move {
        if let Err(err) = axum::serve(admin_listener, app).await {
            error!(error = %err, "admin endpoint stopped");
        }
    });

    let (schema, group) = config.frontend_target()?;
    let read_preference = rule
        .group_config(&schema, &group)
        .map(|config| config.read_preference)
        .unwrap_or_default();
    let executor = Arc::new(CommandExecutor::new(
        rule.clone(),
        registry,
        schema.clone(),
        group.clone(),
    ));

    let listener = TcpListener::bind(&config.server.listen_addr).await?;
    info!(addr = %config.server.listen_addr, schema = %schema, group = %group, "relaygate listening");

    let connections = Arc::new(Semaphore::new(config.server.max_connections));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let Ok(permit) = connections.clone().try_acquire_owned() else {
                    counter!("client_rejected_total").increment(1);
                    warn!(peer = %peer, "connection limit reached");
                    tokio::spawn(async move {
                        let _ = write_message(
                            &mut socket,
                            BackendMessage::ErrorResponse {
                                code: "53300".into(),
                                message: "sorry, too many clients already".into(),
                            },
                        )
                        .await;
                    });
                    continue;
                };
                let session = Session::new(executor.clone());
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = ClientConnection::new(socket, session, read_preference).run().await {
                        error!(peer = %peer, error = %err, "client connection error");
                    }
                });
            }
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }
    runtime.shutdown().await;
    Ok(())
}
