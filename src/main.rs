mod config;
mod db;
mod event;
mod routes;
mod services;
mod state;

use tracing_subscriber::EnvFilter;

use crate::config::{Config, ConfigError};
use crate::services::broker::GroupBroker;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("database init failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("listener: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "brewbuddies-chat failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;
    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;

    let state = state::AppState::from_pool(pool, config.chat);
    let broker = state.broker.clone();

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    tracing::info!(port = config.port, "brewbuddies-chat listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(broker))
        .await?;
    Ok(())
}

/// Resolve on Ctrl-C after closing every live chat connection.
async fn shutdown_signal(broker: GroupBroker) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    let closed = broker.close_all().await;
    tracing::info!(closed, "shutdown: chat connections closed");
}
