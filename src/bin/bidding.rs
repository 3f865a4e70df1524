//! Bidding engine service.
//!
//! Wires the sqlite store, ephemeral store, event log, reaper, and domain
//! event reactor, then serves the RPC surface plus health/metrics endpoints.

use anyhow::{Context, Result};
use axum::middleware as axum_mw;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use porterhub_backend::api::{health_router, HealthState};
use porterhub_backend::auth::{auth_middleware, TokenVerifier};
use porterhub_backend::bidding::api::{router as bidding_router, BiddingApiState};
use porterhub_backend::bidding::{
    AllowAllEligibility, BidWindowManager, BiddingDb, DomainEventReactor, ExpiryReaper,
    HttpEligibility, PorterEligibility,
};
use porterhub_backend::config::AppConfig;
use porterhub_backend::eventlog::{run_consumer, EventLog, EventRouter, KafkaEventLog};
use porterhub_backend::events::topics;
use porterhub_backend::middleware::{rate_limit_middleware, request_logging, RateLimitLayer};
use porterhub_backend::store::{EphemeralStore, RedisStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "porter-bidding", about = "PorterHub bidding engine")]
struct Args {
    /// Bind address override (falls back to BIND_ADDR / config).
    #[arg(long, env = "BIDDING_BIND_ADDR")]
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

    info!("🚀 PorterHub bidding engine starting");

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

    let db = Arc::new(
        BiddingDb::open(&config.bidding.database_path).context("failed to open bidding db")?,
    );
    db.seed_default_strategy(&config.bidding.default_strategy_id)
        .map_err(|e| anyhow::anyhow!("failed to seed default strategy: {e}"))?;

    let eligibility: Arc<dyn PorterEligibility> = match &config.bidding.eligibility_url {
        Some(url) => Arc::new(
            HttpEligibility::new(url).context("failed to build the eligibility client")?,
        ),
        None => {
            info!("no eligibility URL configured; every porter is eligible");
            Arc::new(AllowAllEligibility)
        }
    };

    let manager = Arc::new(BidWindowManager::new(
        db.clone(),
        store.clone(),
        log.clone(),
        eligibility,
        config.bidding.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // expiry reaper
    let reaper = ExpiryReaper::new(manager.clone(), config.bidding.reaper_tick_sec);
    tokio::spawn(reaper.run(shutdown_rx.clone()));

    // domain event reactor on its consumer group
    let mut router = EventRouter::new();
    router.register(Arc::new(DomainEventReactor::new(manager.clone())));
    tokio::spawn(run_consumer(
        log.clone(),
        topics::BIDDING_INBOUND.to_vec(),
        format!("{}-bidding", config.event_log.consumer_group),
        Arc::new(router),
        shutdown_rx.clone(),
    ));

    // HTTP surface
    let verifier = Arc::new(TokenVerifier::new(
        &config.token_verifier.access_key,
        &config.token_verifier.socket_key,
    ));
    let limiter = RateLimitLayer::new(config.gateway.rate_limit.global);
    {
        let limiter = limiter.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => limiter.cleanup(),
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                }
            }
        });
    }

    let rpc = bidding_router(BiddingApiState {
        manager: manager.clone(),
        defaults: config.bidding.clone(),
    })
    .layer(axum_mw::from_fn_with_state(verifier.clone(), auth_middleware))
    .layer(axum_mw::from_fn_with_state(limiter, rate_limit_middleware));

    let app = rpc
        .merge(health_router(HealthState {
            store: store.clone(),
            log: log.clone(),
            db: Some(db.clone()),
            prometheus,
            service: "porter-bidding",
        }))
        .layer(axum_mw::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    let bind = args.bind.unwrap_or_else(|| config.bind_addr.clone());
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %bind, "bidding RPC surface listening");

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
