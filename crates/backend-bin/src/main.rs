use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use backend_lib::ai::GeminiModel;
use backend_lib::config::Settings;
use backend_lib::{ws_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()
        .or_else(|_| Settings::load_from("config/default.toml"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    if settings.ai.api_key.is_empty() {
        tracing::warn!("no vision model api key configured, submissions will fail");
    }

    let bind_addr = settings.bind_addr;
    let model = GeminiModel::from_settings(&settings.ai);
    let state = Arc::new(AppState::new(model, settings));

    let app = ws_router::create_router(state);

    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
