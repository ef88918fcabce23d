use std::sync::Arc;
use tracing::{error, info};

mod bus;
mod catalog;
mod chat;
mod config;
mod engine;
mod entity;
mod http;
mod inference;
mod manager;
mod service;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Chatdesk starting...");
    let config = config::Config::from_env()?;

    let bus = Arc::new(bus::EventBus::new());

    info!("Initializing store at {}", config.db_path.display());
    let store = Arc::new(store::Store::new(&config.db_path).await?);
    store.init().await?;
    store.seed_defaults().await?;

    if config.inference_api_key.is_none() {
        info!("INFERENCE_API_KEY not set, completion requests will be unauthenticated");
    }
    let provider = Arc::new(inference::OpenAiCompatibleClient::new(
        config.inference_base_url.clone(),
        config.inference_api_key.clone(),
    )?);

    let service = Arc::new(service::ChatService::new(
        catalog::Catalog::new(store.clone()),
        manager::SessionManager::new(store.clone(), bus.clone()),
        engine::CompletionEngine::new(
            store.clone(),
            provider,
            bus.clone(),
            config.history_window,
            config.stream_timeout,
        ),
    ));

    let state = Arc::new(http::AppState::new(
        store.clone(),
        service,
        bus.clone(),
        config.admin_email.clone(),
    ));
    let app = http::router(state);

    info!("Starting HTTP server on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
