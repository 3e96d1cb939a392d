mod api;
mod auth;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use kapi_chat::ChatService;
use kapi_core::{ChatStore, LlmProvider, UserId};
use kapi_hub::{Hub, PumpConfig};
use kapi_llm::OpenRouterProvider;
use kapi_logging::init_logger;
use kapi_store::SqliteChatStore;

use api::AppState;
use auth::JwtKeys;
use config::Config;

const APP_REFERER: &str = "http://localhost:8080";
const APP_TITLE: &str = "Kapi Chat";

#[derive(Parser)]
#[command(name = "kapi")]
#[command(about = "Kapi chat backend with live sync and streamed replies")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Port to bind the HTTP server to
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Query a running server's health endpoint
    Status,
    /// Mint a bearer token for local testing
    Token {
        #[arg(long)]
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    let _guard = init_logger(&config.log_level, config.log_dir.as_deref(), config.log_json)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            let config = Config {
                port: port.unwrap_or(config.port),
                ..config
            };
            run_server(config).await?;
        }
        Commands::Status => {
            let client = reqwest::Client::new();
            match client
                .get(format!("http://localhost:{}/health", config.port))
                .send()
                .await
            {
                Ok(resp) => {
                    let body: serde_json::Value = resp.json().await?;
                    println!("{}", serde_json::to_string_pretty(&body)?);
                }
                Err(_) => {
                    println!("Kapi is not running on port {}", config.port);
                }
            }
        }
        Commands::Token { user_id } => {
            let token = JwtKeys::new(&config.jwt_secret)
                .issue(UserId(user_id))
                .context("Failed to sign token")?;
            println!("{token}");
        }
    }

    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    info!(
        port = config.port,
        bind = %config.bind_address,
        db = %config.db_path,
        model = %config.default_model,
        "Starting Kapi"
    );

    if config.uses_default_jwt_secret() {
        warn!("JWT_SECRET is not set, using the built-in default secret");
    }

    let store: Arc<dyn ChatStore> = Arc::new(
        SqliteChatStore::open(&config.db_path)
            .with_context(|| format!("Failed to open database at {}", config.db_path))?,
    );
    let openrouter = OpenRouterProvider::new(config.openrouter_api_key.clone())
        .with_base_url(config.openrouter_url.clone())
        .with_app_identity(APP_REFERER, APP_TITLE);
    if !openrouter.is_configured() {
        warn!("OPENROUTER_API_KEY is not set, streamed replies will fail");
    }
    let provider: Arc<dyn LlmProvider> = Arc::new(openrouter);
    let hub = Hub::spawn();

    let state = Arc::new(AppState {
        service: ChatService::new(store, provider, hub.clone())
            .with_default_model(config.default_model.clone()),
        jwt: JwtKeys::new(&config.jwt_secret),
        pumps: PumpConfig::default(),
    });

    let app = api::build_router(state).layer(CorsLayer::permissive());
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(hub: Hub) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    let closed = hub.shutdown().await;
    info!(closed, "Shutting down, closed live connections");
}
