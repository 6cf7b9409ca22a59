use std::sync::Arc;

use anyhow::{Context, Result};
use tonic::transport::{Identity as TlsIdentity, Server, ServerTlsConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier_config::Config;
use courier_shared::AppContext;
use courier_shared::auth::AuthManager;
use courier_shared::interceptor::AuthLayer;
use courier_shared::proto::broker::v1::broker_server::BrokerServer;
use courier_shared::service::BrokerService;
use courier_shared::spool::Spool;
use courier_shared::sweeper;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (needed for logging)
    let config = Config::from_env().context("failed to load configuration")?;
    let config = Arc::new(config);

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Courier Broker Starting ===");
    info!(
        "Listen: {}:{} (TLS: {})",
        config.server.host, config.server.port, config.server.tls_enabled
    );
    info!(
        "Spool: {} (tick {}s, max_age {}s, max_stored {} advisory)",
        config.database.path.display(),
        config.server.tick_seconds,
        config.server.max_age_secs,
        config.server.max_stored
    );

    let spool = Arc::new(Spool::open(&config.database.path).context("failed to open spool")?);
    info!("Spool opened");

    let auth = Arc::new(AuthManager::new(&config.auth));
    if !config.auth.enabled {
        tracing::warn!("authentication is disabled; all callers are anonymous");
    }

    let ctx = Arc::new(AppContext::new(config.clone(), spool.clone(), auth.clone()));

    // Background expiration sweeper
    let sweeper_cancel = sweeper::spawn_expiration_sweeper(ctx.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid listen address")?;

    let mut builder = Server::builder();
    if config.server.tls_enabled {
        let cert = tokio::fs::read(&config.server.tls_cert_file)
            .await
            .context("failed to read TLS certificate")?;
        let key = tokio::fs::read(&config.server.tls_key_file)
            .await
            .context("failed to read TLS key")?;
        builder = builder
            .tls_config(ServerTlsConfig::new().identity(TlsIdentity::from_pem(cert, key)))
            .context("invalid TLS configuration")?;
        info!("TLS enabled");
    }

    info!("Broker listening on {}", addr);
    builder
        .layer(AuthLayer::new(auth))
        .add_service(BrokerServer::new(BrokerService::new(ctx)))
        .serve_with_shutdown(addr, courier_shared::shutdown_signal())
        .await
        .context("broker server failed")?;

    // Stop housekeeping, then flush the spool before exiting.
    sweeper_cancel.cancel();
    spool.sync().context("failed to flush spool")?;
    info!("Spool flushed, shutdown complete");

    Ok(())
}
