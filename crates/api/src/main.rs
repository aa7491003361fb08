//! Service entry point: configuration, store selection, worker spawn, serve.
//!
//! Exit codes: 0 on clean shutdown, 1 on fatal init failure.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use meterline_api::{build_router, AppState};
use meterline_billing::{DisabledGateway, PaymentGateway, StripeHttpGateway};
use meterline_shared::{Clock, Config, SystemClock};
use meterline_store::{MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => match PgStore::connect(url).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                tracing::error!(error = %err, "database connection failed");
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    if let Err(err) = store.ping().await {
        tracing::error!(error = %err, "store ping failed at startup");
        std::process::exit(1);
    }

    let gateway: Arc<dyn PaymentGateway> = match &config.stripe_secret_key {
        Some(key) => Arc::new(StripeHttpGateway::new(key.clone())),
        None => {
            tracing::warn!("STRIPE_SECRET_KEY not set; gateway endpoints disabled");
            Arc::new(DisabledGateway)
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::build(store.clone(), clock.clone(), config.clone(), gateway);

    // Background runners.
    let (shutdown_handle, shutdown) = meterline_worker::shutdown_channel();
    let workers = vec![
        meterline_worker::spawn_pricing_loop(
            state.pricing_worker.clone(),
            config.pricing_poll_interval,
            shutdown.clone(),
        ),
        meterline_worker::spawn_wallet_sweep(
            state.wallet.clone(),
            config.wallet_sweep_interval,
            shutdown.clone(),
        ),
        meterline_worker::spawn_period_close(
            state.period_close.clone(),
            clock.clone(),
            config.period_close_interval,
            shutdown.clone(),
        ),
        meterline_worker::spawn_jti_sweep(
            store.clone(),
            clock.clone(),
            config.jti_sweep_interval,
            shutdown,
        ),
    ];

    let app = build_router(state);
    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, addr, "bind failed");
            std::process::exit(1);
        }
    };
    tracing::info!(addr, "meterline listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = serve.await {
        tracing::error!(error = %err, "server error");
        std::process::exit(1);
    }

    // Cooperative worker shutdown: loops finish their in-flight tick.
    shutdown_handle.trigger();
    for worker in workers {
        let _ = worker.await;
    }
    tracing::info!("shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
