// stratum-pool: runs every enabled pool of a cluster configuration
//
// Usage: stratum-pool [config.json]

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use stratum_pool::banning::{self, BanManager};
use stratum_pool::config::{ClusterConfig, CoinFamilyKind, PoolConfig, DEFAULT_CONFIG_PATH};
use stratum_pool::crypto::equihash::{EquihashVerifier, SolutionVerifier};
use stratum_pool::daemon::{DaemonClient, DaemonRpc};
use stratum_pool::events::{EventBus, PoolEvent};
use stratum_pool::jobs::bitcoin::{header_hasher, BitcoinFamily, BitcoinSettings};
use stratum_pool::jobs::ethereum::{EthereumFamily, EthereumSettings};
use stratum_pool::jobs::zcash::{ZcashFamily, ZcashSettings};
use stratum_pool::jobs::CoinFamily;
use stratum_pool::metrics::prometheus as metrics;
use stratum_pool::{Pool, PoolInfo};

#[derive(Clone)]
struct ApiState {
    cluster_name: String,
    pools: Arc<Vec<Arc<dyn PoolInfo>>>,
}

async fn api_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let pools: Vec<_> = state.pools.iter().map(|p| p.status()).collect();
    let online = pools.iter().all(|p| p.online);
    Json(json!({
        "status": if online { "ok" } else { "starting" },
        "cluster": state.cluster_name,
        "pools": pools,
    }))
}

async fn api_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
}

fn launch<F: CoinFamily>(
    pool_cfg: &PoolConfig,
    cluster: &ClusterConfig,
    family: F,
    bans: &Arc<dyn BanManager>,
    events: &EventBus,
    cancel: &CancellationToken,
) -> Arc<dyn PoolInfo> {
    let pool = Pool::new(pool_cfg.clone(), cluster, Arc::new(family), Arc::clone(bans), events.clone());
    let runner = Arc::clone(&pool);
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let id = runner.id().to_string();
        if let Err(e) = runner.run(cancel).await {
            tracing::error!("[{}] ❌ Pool failed to start: {:#}", id, e);
        }
    });
    pool
}

/// Accepted shares and blocks leave the engine here; persistence and
/// payouts subscribe to the same bus.
fn spawn_event_log(events: &EventBus, cancel: CancellationToken) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(PoolEvent::FoundBlock(block)) => {
                    tracing::info!("[{}] 📦 Block {} found", block.pool_id, block.height)
                }
                Ok(PoolEvent::AcceptedShare(accepted)) => tracing::trace!(
                    "[{}] share {} from {}",
                    accepted.share.pool_id,
                    accepted.share.difficulty,
                    accepted.remote_address
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("⚠️  Event log lagged by {} events", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
                _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT, shutting down"),
            },
            Err(e) => {
                tracing::warn!("⚠️  SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C, shutting down");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("STRATUM_POOL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let cfg = ClusterConfig::load(&path)?;
    tracing::info!("🚀 Starting cluster {} with {} pool(s)", cfg.cluster_name, cfg.pools.len());

    let cancel = CancellationToken::new();
    let bans = banning::from_config(&cfg.banning);
    let events = EventBus::default();
    spawn_event_log(&events, cancel.clone());

    // one solver budget shared by every Equihash pool
    let equihash: Arc<dyn SolutionVerifier> = Arc::new(EquihashVerifier::zcash(cfg.equihash_max_threads));

    let mut pools: Vec<Arc<dyn PoolInfo>> = Vec::new();
    for pool_cfg in cfg.pools.iter().filter(|p| p.enabled) {
        let daemon: Arc<dyn DaemonRpc> = Arc::new(DaemonClient::new(&pool_cfg.daemons)?);
        let pool = match pool_cfg.family {
            CoinFamilyKind::Bitcoin => {
                let hasher = header_hasher(pool_cfg.algorithm)?;
                let family = BitcoinFamily::with_hasher(daemon, BitcoinSettings::from_config(pool_cfg), hasher);
                launch(pool_cfg, &cfg, family, &bans, &events, &cancel)
            }
            CoinFamilyKind::Ethereum => {
                let family = EthereumFamily::new(daemon, EthereumSettings::from_config(pool_cfg));
                launch(pool_cfg, &cfg, family, &bans, &events, &cancel)
            }
            CoinFamilyKind::Zcash => {
                let family = ZcashFamily::new(daemon, ZcashSettings::from_config(pool_cfg), Arc::clone(&equihash));
                launch(pool_cfg, &cfg, family, &bans, &events, &cancel)
            }
        };
        pools.push(pool);
    }

    let state = ApiState {
        cluster_name: cfg.cluster_name.clone(),
        pools: Arc::new(pools),
    };
    let api = Router::new()
        .route("/health", get(api_health))
        .route("/metrics", get(api_metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.api_bind).await?;
    tracing::info!("📡 API listening on {}", cfg.api_bind);
    axum::serve(listener, api).with_graceful_shutdown(shutdown_signal()).await?;

    cancel.cancel();
    tracing::info!("🏁 Cluster {} shut down cleanly", cfg.cluster_name);
    Ok(())
}
