//! Miner node - registers with a gateway, keeps the tunnel open and proxies
//! inference jobs to the local Ollama engine.

use std::env;

use tokio::net::TcpListener;

use miner_node::{api, logging, startup, AppState, Config, Services};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    if env::args().any(|a| a == "--version" || a == "-V") {
        println!("miner-node {}", VERSION);
        return Ok(());
    }

    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Check config.toml or the MINER__SECTION__KEY environment variables.",
            e
        )
    })?;

    logging::init(&config.logging.level);
    tracing::info!("Starting miner-node {}", VERSION);

    let services = Services::from_config(&config)?;
    tracing::info!("Using Ollama at {}", config.ollama.base_url);
    tracing::info!("Database at {}", config.database.url);

    let state = AppState::build(config.clone(), services)?;
    let _events = state.registration.spawn_event_listener();
    let _heartbeat = state.heartbeat.clone().start();
    let _auto_registration = startup::initialize(&state).await;

    let app = api::app(state.clone());

    let addr = format!("{}:{}", config.api.host, config.api.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    state.tunnel.disconnect().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
