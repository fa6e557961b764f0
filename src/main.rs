//! Cohort Back binary entrypoint wiring the change feed, the engine tickers and the REST/SSE layers.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cohort_back::{
    config::AppConfig,
    dao::{backend::Backend, memory::InMemoryBackend},
    routes,
    services::feed,
    state::{AppState, SharedState, timer::Ticker},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
    let (app_state, queue) = AppState::new(config.clone(), backend.clone());

    let writer = feed::spawn_writer(backend, queue, app_state.degraded_watcher());
    tokio::spawn(feed::run(app_state.clone()));
    let tickers = spawn_tickers(&app_state, &config);

    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    for ticker in tickers {
        ticker.shutdown().await;
    }
    writer.abort();
    Ok(())
}

/// Start the stage timer pass and the lobby timeout sweep.
fn spawn_tickers(state: &SharedState, config: &AppConfig) -> Vec<Ticker> {
    let timer_state = state.clone();
    let timers = Ticker::spawn(config.tick_interval, move |now| {
        let state = timer_state.clone();
        async move { state.on_tick(now).await }
    });

    let lobby_state = state.clone();
    let lobbies = Ticker::spawn(config.lobby_sweep_interval, move |_| {
        let state = lobby_state.clone();
        async move {
            if let Err(err) = state.sweep_lobbies().await {
                warn!(error = %err, "lobby sweep failed");
            }
        }
    });

    vec![timers, lobbies]
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
