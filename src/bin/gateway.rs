//! Realtime gateway service.
//!
//! Wires the ephemeral store, event log, and the gateway component graph,
//! starts the cross-instance fan-out pump, the event consumer, and the offer
//! sweeper, then serves the WebSocket namespaces plus health/metrics.

use anyhow::{Context, Result};
use axum::middleware as axum_mw;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use porterhub_backend::api::{health_router, HealthState};
use porterhub_backend::auth::TokenVerifier;
use porterhub_backend::config::AppConfig;
use porterhub_backend::eventlog::{run_consumer, EventLog, EventRouter, KafkaEventLog};
use porterhub_backend::events::topics;
use porterhub_backend::gateway::consumer::GatewayEventConsumer;
use porterhub_backend::gateway::{ws, GatewayState};
use porterhub_backend::middleware::request_logging;
use porterhub_backend::store::{EphemeralStore, RedisStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "porter-gateway", about = "PorterHub realtime gateway")]
struct Args {
    /// Bind address override (falls back to BIND_ADDR / config).
    #[arg(long, env = "GATEWAY_BIND_ADDR")]
    bind: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "porterhub_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let args = Args::parse();
    let config = AppConfig::from_env();

    info!("🚀 PorterHub realtime gateway starting");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install prometheus recorder")?;

    let store: Arc<dyn EphemeralStore> = Arc::new(
        RedisStore::connect(&config.store.url, &config.store.key_prefix)
            .await
            .context("failed to connect to the ephemeral store")?,
    );
    let log: Arc<dyn EventLog> = Arc::new(
        KafkaEventLog::new(&config.event_log).context("failed to build the event log client")?,
    );
    let verifier = Arc::new(TokenVerifier::new(
        &config.token_verifier.access_key,
        &config.token_verifier.socket_key,
    ));

    let state = GatewayState::build(
        config.gateway.clone(),
        verifier,
        store.clone(),
        log.clone(),
    );
    state
        .broker
        .run_fanout()
        .await
        .context("failed to start the fan-out pump")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // order/offer events from the log into rooms and the offer broker
    let mut router = EventRouter::new();
    router.register(Arc::new(GatewayEventConsumer::new(state.clone())));
    tokio::spawn(run_consumer(
        log.clone(),
        topics::GATEWAY_INBOUND.to_vec(),
        format!("{}-gateway", config.event_log.consumer_group),
        Arc::new(router),
        shutdown_rx.clone(),
    ));

    // restart-safe offer expiry backstop
    tokio::spawn(state.offers.clone().run_sweeper(shutdown_rx.clone()));

    // rate limiter housekeeping
    {
        let location = state.location.clone();
        let chat = state.chat.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        location.cleanup();
                        chat.cleanup();
                    }
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                }
            }
        });
    }

    let app = ws::router(state.clone())
        .merge(health_router(HealthState {
            store: store.clone(),
            log: log.clone(),
            db: None,
            prometheus,
            service: "porter-gateway",
        }))
        .layer(axum_mw::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    let bind = args.bind.unwrap_or_else(|| config.bind_addr.clone());
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(
        addr = %bind,
        max_connections = config.gateway.max_connections,
        "gateway listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    })
    .await
    .context("server error")?;

    Ok(())
}
