use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use insightweave::config::AppConfig;
use insightweave::engine::GraphEngine;
use insightweave::llm::ArkClient;
use insightweave::server::{router, AppState};
use insightweave::store::{MemoryStore, PgStore, SharedStore};

/// Multi-agent market-insight orchestration service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "0.0.0.0:8000", env = "BIND_ADDR")]
    bind: SocketAddr,

    /// Run without the model provider even when ARK_API_KEY is set
    /// (agents produce placeholder output; useful for demos).
    #[arg(long, default_value_t = false)]
    placeholder: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(AppConfig::from_env());

    let model = if args.placeholder {
        info!("placeholder mode: model provider disabled");
        None
    } else {
        match ArkClient::new(&config.llm) {
            Ok(client) => Some(Arc::new(client) as Arc<dyn insightweave::llm::ChatModel>),
            Err(e) => {
                warn!(error = %e, "model provider unavailable; running in placeholder mode");
                None
            }
        }
    };

    let store: SharedStore = if config.store.is_configured() {
        match PgStore::connect(&config.store).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(error = %e, "store connection failed; falling back to in-memory store");
                Arc::new(MemoryStore::new())
            }
        }
    } else {
        info!("no store configured; using in-memory store (no recovery across restarts)");
        Arc::new(MemoryStore::new())
    };

    let engine = Arc::new(GraphEngine::new(config.clone(), model, store));
    let app = router(AppState { engine });

    info!(bind = %args.bind, "listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
