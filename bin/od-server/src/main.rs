//! Outdial Server
//!
//! Single binary running the campaign HTTP API, the background campaign
//! driver with its scheduler tick, and the stale recipient sweep.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OUTDIAL_CONFIG` | - | Path to the TOML configuration file |
//! | `OUTDIAL_*` | - | Per-key overrides, e.g. `OUTDIAL_HTTP_PORT` |
//! | `LOG_FORMAT` | `text` | `json` for structured output |
//! | `RUST_LOG` | `info` | Log level |

mod api;
mod providers;
mod seed;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use od_config::AppConfig;
use od_engine::{
    CampaignDriver, CampaignStore, ChunkProcessor, ChunkProcessorConfig, DriverConfig, MemoryCampaignStore,
    SqliteCampaignStore, StaleRecipientSweeper, SweeperConfig,
};
use od_gateway::{CircuitBreakerConfig, CircuitBreakerRegistry, ProviderGateway};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const DEMO_RECIPIENTS: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    od_common::logging::init_logging("od-server");

    info!("Starting Outdial Server");

    let config = AppConfig::load()?;
    info!(
        port = config.http.port,
        store = %config.store.store_type,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    let store = create_store(&config).await?;

    let registry = Arc::new(CircuitBreakerRegistry::new(breaker_config(&config)));
    let (primary, secondary) = providers::build(&config)?;
    let gateway = Arc::new(
        ProviderGateway::new(registry.clone(), primary, secondary)
            .with_default_expiry(chrono::Duration::days(config.dispatch.default_expiry_days)),
    );

    let processor = Arc::new(ChunkProcessor::new(
        store.clone(),
        gateway,
        ChunkProcessorConfig {
            default_chunk_size: config.dispatch.chunk_size,
            batch_config: config.dispatch.batch_config(),
        },
    ));

    if config.dev_mode {
        let campaign = seed::seed_demo_campaign(store.as_ref(), DEMO_RECIPIENTS).await?;
        info!(campaign_id = %campaign.id, recipients = DEMO_RECIPIENTS, "DEV: Seeded demo campaign");
    }

    // Campaign driver and its scheduler tick
    let mut background = Vec::new();
    let driver = if config.driver.enabled {
        let driver = Arc::new(CampaignDriver::new(
            processor.clone(),
            DriverConfig {
                workers: config.driver.workers,
                channel_capacity: config.driver.channel_capacity,
                tick_interval: Duration::from_secs(config.driver.tick_interval_secs),
            },
        ));
        background.extend(driver.start());

        let scheduler = driver.clone();
        background.push(tokio::spawn(async move { scheduler.run_scheduler().await }));
        Some(driver)
    } else {
        warn!("Campaign driver disabled, background runs will be rejected");
        None
    };

    let sweeper = Arc::new(StaleRecipientSweeper::new(store.clone(), sweeper_config(&config)));
    let sweep_handle = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move { sweeper.run().await })
    };

    let state = api::AppState {
        processor,
        driver: driver.clone(),
        sweeper,
        registry,
    };
    let app = api::create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    info!(?addr, "HTTP server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown signal received...");
    if let Some(driver) = &driver {
        driver.stop();
    }
    sweep_handle.abort();

    // Workers finish the campaign they are driving
    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        for handle in background {
            let _ = handle.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Campaign driver did not stop within 30s");
    }

    info!("Outdial Server shutdown complete");
    Ok(())
}

async fn create_store(config: &AppConfig) -> Result<Arc<dyn CampaignStore>> {
    match config.store.store_type.as_str() {
        "sqlite" => {
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&config.store.url)
                .await?;
            let store = SqliteCampaignStore::new(pool);
            store.init_schema().await?;
            info!(url = %config.store.url, "Using SQLite campaign store");
            Ok(Arc::new(store))
        }
        "memory" => {
            info!("Using in-memory campaign store");
            Ok(Arc::new(MemoryCampaignStore::new()))
        }
        other => Err(anyhow::anyhow!("Unknown store type: {}. Use memory or sqlite", other)),
    }
}

fn breaker_config(config: &AppConfig) -> CircuitBreakerConfig {
    let settings = &config.circuit_breaker;
    CircuitBreakerConfig {
        failure_threshold: settings.failure_threshold,
        success_threshold: settings.success_threshold,
        reset_timeout: settings.reset_timeout(),
        call_timeout: settings.call_timeout(),
    }
}

fn sweeper_config(config: &AppConfig) -> SweeperConfig {
    let settings = &config.sweeper;
    SweeperConfig {
        enabled: settings.enabled,
        interval: Duration::from_secs(settings.interval_secs),
        calling_stale_after: Duration::from_secs(settings.calling_stale_minutes * 60),
        batch_stale_after: Duration::from_secs(settings.batch_stale_minutes * 60),
        queued_stale_after: Duration::from_secs(settings.queued_stale_minutes * 60),
        batch_limit: settings.batch_limit,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
