use anyhow::Result;
use depth_gateway::cache::CacheWriter;
use depth_gateway::config::Config;
use depth_gateway::ingest::{depth_stream, user_stream};
use depth_gateway::metrics::HealthMetrics;
use depth_gateway::orderbook::LocalBook;
use depth_gateway::publisher;
use depth_gateway::rest::ApiClient;
use depth_gateway::sync::{run_sync_coordinator, SyncOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

const RECONCILE_PERIOD: Duration = Duration::from_secs(5 * 60);
const HEALTH_LOG_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let cfg = Config::load(&config_path)?;
    let env = cfg.binance.active_env().clone();
    let symbol = cfg.binance.symbol.clone();
    info!("starting depth gateway [{}] for {}", cfg.binance.active_env, symbol);

    let cache = CacheWriter::connect(&cfg.redis.addr, cfg.redis.db).await?;
    info!("cache connected at {}", cfg.redis.addr);

    let api = Arc::new(ApiClient::new(
        env.rest_base_url.clone(),
        env.api_key.clone(),
        env.api_secret.clone(),
    ));

    // Seed wallet/position keys before the streams start so readers never
    // see an empty mirror; the reconciler heals a failed seed.
    user_stream::reconcile_once(&api, &cache, &symbol).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = HealthMetrics::new();

    let book = Arc::new(LocalBook::new(symbol.clone()));
    let (publish_tx, publish_rx) = mpsc::channel::<()>(1);
    let (resync_tx, resync_rx) = mpsc::channel::<()>(1);

    tokio::spawn(depth_stream::run_depth_stream(
        env.ws_depth_url.clone(),
        depth_stream::apply_to_book(book.clone(), publish_tx, resync_tx, metrics.clone()),
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    tokio::spawn(run_sync_coordinator(
        api.http().clone(),
        env.rest_base_url.clone(),
        book.clone(),
        resync_rx,
        metrics.clone(),
        SyncOptions::default(),
        shutdown_rx.clone(),
    ));

    tokio::spawn(publisher::run_top_n_publisher(
        book.clone(),
        cache.clone(),
        publish_rx,
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    tokio::spawn(user_stream::run_user_stream(
        api.clone(),
        cache.clone(),
        symbol.clone(),
        cfg.binance.user_ws_base().to_string(),
        shutdown_rx.clone(),
    ));

    tokio::spawn(user_stream::run_reconciliation(
        api.clone(),
        cache.clone(),
        symbol.clone(),
        RECONCILE_PERIOD,
        shutdown_rx.clone(),
    ));

    tokio::spawn(metrics.clone().run_health_log(HEALTH_LOG_PERIOD, shutdown_rx));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => warn!("failed to listen for shutdown signal: {:?}", e),
    }
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("depth gateway stopped");
    Ok(())
}
