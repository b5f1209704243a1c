//! Data Product Gateway server
//!
//! Loads configuration from the environment, wires the pipeline to the
//! Snowflake connector and serves the HTTP API until SIGINT/SIGTERM.

use dataproduct_gateway_api::{
    api_keys::KeyStore,
    audit::{audit_writer_task, AuditLogger, TracingSink},
    registry::DatasetRegistry,
    router, AppState, GatewayConfig, Pipeline,
};
use dataproduct_gateway_warehouse::{
    credential::{KeypairConfig, KeypairCredentialProvider},
    snowflake::{SnowflakeConfig, SnowflakeConnector},
};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = GatewayConfig::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    if config.environment.is_production() {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    config
        .validate()
        .map_err(|e| format!("Invalid configuration: {}", e))?;

    let registry = DatasetRegistry::load(&config.registry);

    let keypair = KeypairConfig::from_env()?;
    let credentials = Arc::new(KeypairCredentialProvider::new(&keypair)?);
    let connector = Arc::new(SnowflakeConnector::new(SnowflakeConfig::from_env())?);

    let keys = KeyStore::new(config.keys.clone(), credentials);
    if !keys.is_admin_configured() {
        tracing::warn!("No admin secret configured, admin endpoints will answer 503");
    }

    let (audit, audit_receiver) = AuditLogger::new(&config.audit);
    let audit_task = tokio::spawn(audit_writer_task(
        audit_receiver,
        Arc::new(TracingSink),
        config.audit.clone(),
    ));

    let pipeline = Pipeline::new(registry, keys, connector, audit, &config);
    let app = router(AppState::new(pipeline));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, environment = ?config.environment, "Data Product Gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // The router (and with it every AuditLogger handle) is gone once serve
    // returns, so the writer drains and exits.
    if let Err(e) = audit_task.await {
        tracing::error!(error = %e, "Audit writer task failed");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
