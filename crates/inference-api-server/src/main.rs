use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use inference_api_server::build_router;
use inference_api_server::config::Settings;
use inference_api_server::database::EventLog;
use inference_api_server::services::{ContextBudgetManager, Generator, LlmService, SessionStore};
use inference_api_server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,inference_api_server=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("🚀 Starting inference API server...");

    let settings = Settings::load()?;
    info!("✅ Configuration loaded");

    // Durable log is best-effort: a failed open degrades to in-memory only.
    let event_log = if settings.sessions.persist {
        match EventLog::connect(&settings.sessions.db_path).await {
            Ok(log) => Some(Arc::new(log)),
            Err(e) => {
                warn!("Durable event log unavailable ({}), resume limited to in-memory buffer", e);
                None
            }
        }
    } else {
        None
    };

    let generator = Arc::new(LlmService::new(settings.llm.clone())?);
    let probe = generator.clone();
    tokio::spawn(async move {
        match probe.probe().await {
            Ok(()) => info!("✅ Generation backend reachable"),
            Err(e) => warn!("Generation backend not reachable yet ({}), requests will fail until it is", e),
        }
    });

    let store = Arc::new(SessionStore::new(&settings.sessions));
    let context = Arc::new(ContextBudgetManager::new(&settings.context));

    let state = AppState {
        settings: settings.clone(),
        store,
        generator,
        context,
        event_log,
    };

    let app = build_router(state);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("🎯 Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
