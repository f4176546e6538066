//! Gateway service entry point.
//!
//! Presence-aware WebSocket message gateway.

use anyhow::{Context, Result};
use im_gateway::{
    create_router, AppState, ConnectionRegistry, EndpointRuntime, FanoutBus, GatewayConfig,
    LocalFanoutBus, LocalPresence, NatsFanoutBus, NatsPresence, PresenceDirectory,
    RoutingService,
};
use membership_store::{InMemoryMembershipStore, MembershipStore, RedisMembershipStore};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::NatsClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting IM gateway");

    let config = GatewayConfig::from_env()?;
    info!("Configuration:");
    info!("  HTTP address: {}", config.http_addr);
    info!("  METRICS_PORT: {:?}", config.metrics_port);
    info!("  REDIS_URL: {}", config.redis_url.as_deref().unwrap_or("(in-memory store)"));
    info!("  NATS_URL: {}", config.nats_url.as_deref().unwrap_or("(in-process bus)"));
    info!("  STORE_TIMEOUT: {:?}", config.store_timeout);

    // Start Prometheus metrics server
    if let Some(port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("Failed to start Prometheus exporter")?;
        info!("Prometheus metrics server started on port {}", port);
    }

    let store: Arc<dyn MembershipStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisMembershipStore::connect(url).await?),
        None => Arc::new(InMemoryMembershipStore::new()),
    };

    let nats_client = match &config.nats_url {
        Some(url) => Some(Arc::new(NatsClient::connect(url).await?)),
        None => None,
    };
    let bus: Arc<dyn FanoutBus> = match &nats_client {
        Some(client) => Arc::new(NatsFanoutBus::new(
            client.clone(),
            config.nats_subject_prefix.clone(),
        )),
        None => Arc::new(LocalFanoutBus::new()),
    };

    let endpoints = Arc::new(EndpointRuntime::new(config.endpoint_config()));
    let presence: Arc<dyn PresenceDirectory> = match &nats_client {
        Some(client) => Arc::new(NatsPresence::new(
            client.clone(),
            endpoints,
            config.nats_presence_prefix.clone(),
            config.presence_timeout,
        )),
        None => Arc::new(LocalPresence::new(endpoints)),
    };

    let registry = Arc::new(ConnectionRegistry::new());
    let shutdown = CancellationToken::new();

    let state = Arc::new(AppState {
        registry: registry.clone(),
        presence,
        router: Arc::new(RoutingService::new(store, bus, config.router_config())),
        session: config.session_config(),
        shutdown: shutdown.clone(),
    });

    let app = create_router(state);

    let listener = TcpListener::bind(config.http_addr).await?;
    info!("Gateway listening on {}", config.http_addr);

    // Upgraded sockets outlive the HTTP server, so cancel them as soon as
    // the signal arrives.
    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    wait_for_drain(&registry, config.shutdown_grace).await;

    if let Some(client) = nats_client {
        if let Err(e) = client.flush().await {
            warn!("NATS flush on shutdown failed: {}", e);
        }
    }

    info!("Gateway stopped");
    Ok(())
}

/// Wait until every connection has torn down, or `grace` has passed.
async fn wait_for_drain(registry: &ConnectionRegistry, grace: Duration) {
    let drained = tokio::time::timeout(grace, async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    match drained {
        Ok(()) => info!("All connections closed"),
        Err(_) => warn!(
            "{} connections still open after {:?}",
            registry.connection_count(),
            grace
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
