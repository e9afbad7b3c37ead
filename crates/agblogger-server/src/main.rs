use agblogger_server::{AppState, ServerSettings, build_router};
use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = ServerSettings::from_env().context("failed to read settings")?;
    let bind = settings.bind;
    let state = AppState::initialize(settings).await.context("failed to initialize")?;
    let renderer = state.renderer.clone();
    let app = build_router(state);

    let listener =
        tokio::net::TcpListener::bind(bind).await.with_context(|| format!("bind {bind}"))?;
    info!(addr = %bind, "agblogger listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            renderer.shutdown().await;
        })
        .await
        .context("server error")?;
    Ok(())
}
