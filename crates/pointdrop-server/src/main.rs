use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pointdrop_server::config::{AppConfig, LOG_ENV_VAR};
use pointdrop_server::db::{create_pool, run_migrations};
use pointdrop_server::gateway::{GatewayClient, TradeQuery};
use pointdrop_server::store::{MemoryStore, PgStore, Store};
use pointdrop_server::sweeper::Sweeper;
use pointdrop_server::{create_router, AppState};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("pointdrop_server=info,tower_http=info")
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load().context("loading configuration")?;
    tracing::info!(gateway = ?config.gateway, "Configuration loaded");

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url, &config.database)
                .await
                .context("connecting to database")?;
            run_migrations(&pool).await.context("running migrations")?;
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("No database_url configured, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let gateway: Arc<dyn TradeQuery> =
        Arc::new(GatewayClient::new(&config.gateway).context("building gateway client")?);

    let state = AppState::new(store.clone(), gateway.clone(), &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = if config.reconcile.sweep_interval_secs > 0 {
        let sweeper = Sweeper::new(
            store,
            state.queue.clone(),
            gateway,
            Duration::from_secs(config.reconcile.sweep_interval_secs),
            Duration::from_secs(config.reconcile.sweep_min_age_secs),
        );
        Some(sweeper.spawn(shutdown_rx))
    } else {
        None
    };

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "Pointdrop server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweeper {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Sweeper task failed");
        }
    }

    Ok(())
}
