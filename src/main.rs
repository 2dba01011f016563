use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::signal;
use tracing::{error, info, warn};

use bookshop_api as api;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);

    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db = Arc::new(db_pool);

    let (event_sender, _event_task) = api::events::channel(1024);
    let event_sender = Arc::new(event_sender);

    let config = Arc::new(cfg);
    let state = Arc::new(api::AppState::build(
        db,
        config.clone(),
        event_sender,
    ));

    spawn_cart_sweeper(state.clone());

    let app = api::create_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Periodically abandons expired carts and prunes finished idempotency
/// keys. Disabled when the interval is zero.
fn spawn_cart_sweeper(state: Arc<api::AppState>) {
    let interval_secs = state.config.cart_sweep_interval_secs;
    if interval_secs == 0 {
        info!("Cart sweeper disabled");
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match state.services.carts.expire_stale_carts().await {
                Ok(result) if result.abandoned_count > 0 => {
                    info!(
                        abandoned = result.abandoned_count,
                        released_items = result.released_items,
                        "Stale cart sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Stale cart sweep failed: {}", e),
            }

            let cutoff = chrono::Utc::now() - chrono::Duration::hours(24);
            if let Err(e) = state.services.idempotency.prune_older_than(cutoff).await {
                warn!("Idempotency key prune failed: {}", e);
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
