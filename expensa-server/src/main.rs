use std::sync::Arc;

use clap::Parser;
use expensa_core::llm::ChatClient;
use expensa_core::store::ConversationStore;
use expensa_core::{ExpensaConfig, ExpensaError};
use expensa_ingest::{DocumentExtractor, ExtractionConfig};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use expensa_server::http::{start_http_server, HttpState};
use expensa_server::subsystems::chat::ChatService;
use expensa_server::subsystems::sessions::{client_factory, SessionRegistry};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "expensa.toml")]
    config: String,

    /// Check database and model API connectivity, then exit
    #[arg(long)]
    health: bool,
}

/// Connect, make sure the schema exists, and report the server version.
async fn check_database(config: &ExpensaConfig) -> Result<String, ExpensaError> {
    let store = ConversationStore::connect(&config.database).await?;
    Ok(store.health_check().await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match ExpensaConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level)),
        )
        .init();

    // The model client refuses to start without a key
    let model_config = config.model.to_model_config();
    let probe = match ChatClient::new(model_config.clone()).map_err(ExpensaError::from) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Failed to initialize model client: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        let mut healthy = true;

        match check_database(&config).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL check failed: {}", e);
                healthy = false;
            }
        }

        if probe.test_connection().await {
            println!("✅ Model API reachable: {}", probe.model_info().model);
        } else {
            println!("❌ Model API connection test failed");
            healthy = false;
        }

        if !healthy {
            std::process::exit(1);
        }
        println!("✅ Expensa health check passed");
        return Ok(());
    }
    drop(probe);

    // Persistence is optional; chat keeps working without it
    let store = match ConversationStore::connect(&config.database).await {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!(error = %e, "Database unavailable, conversations will not be persisted");
            None
        }
    };

    let chat = Arc::new(ChatService {
        store,
        extractor: DocumentExtractor::new(ExtractionConfig::from(&config.extraction)),
        history_window: config.http.history_window,
    });

    let state = Arc::new(HttpState {
        sessions: SessionRegistry::new(client_factory(model_config)),
        chat,
        config,
    });

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
