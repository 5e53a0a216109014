mod config;
mod download;
mod encoder;
mod gemini;
mod models;
mod orchestrator;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Settings;
use crate::gemini::GeminiClient;
use crate::orchestrator::{ApiKeySource, BatchOrchestrator};
use crate::routes::{router, AppState, SessionLimits};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let settings = Settings::from_env();
    tracing::info!(
        model = %settings.model,
        count = settings.generation_count,
        concurrency = settings.max_concurrency,
        timeout = ?settings.request_timeout,
        "Loaded settings"
    );
    let api_key = ApiKeySource::default();
    if api_key.resolve().is_err() {
        tracing::warn!("⚠️ No Gemini API key set yet; generation will fail until GEMINI_API_KEY is provided");
    }

    let editor = Arc::new(GeminiClient::new(settings.api_base.clone(), settings.model.clone()));
    let orchestrator = BatchOrchestrator::new(editor, api_key)
        .with_max_concurrency(settings.max_concurrency)
        .with_request_timeout(settings.request_timeout);
    let state = AppState::new(Arc::new(orchestrator), settings.generation_count)
        .with_limits(SessionLimits { idle_ttl: settings.session_ttl, max_sessions: settings.max_sessions });

    // Sweep idle sessions in the background; creation also evicts on demand.
    let sweeper = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tick.tick().await;
            sweeper.evict_idle(std::time::Instant::now());
        }
    });

    let app = router(state, settings.max_upload_bytes);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
