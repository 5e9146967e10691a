//! syn4pse - local inference gateway.

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::{middleware, Router};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use syn4pse::backend::{llama, piper, whisper, Registry, ServerManager};
use syn4pse::config::{defaults, Watcher};
use syn4pse::{api, envvar, logging, model, state::AppState};

#[derive(Debug, Parser)]
#[command(name = "syn4pse", version, about = "Local inference gateway")]
struct Args {
    /// HTTP port to listen on.
    #[arg(long, env = "SYN4PSE_SERVER_HTTP_PORT", default_value_t = 8080)]
    http_port: u16,

    /// gRPC port (reserved; no gRPC surface is mounted).
    #[arg(long, env = "SYN4PSE_SERVER_GRPC_PORT", default_value_t = 50051)]
    grpc_port: u16,

    /// Path to the YAML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the JSON schema file.
    #[arg(long)]
    schema: Option<PathBuf>,
}

fn init_tracing() {
    let profile = std::env::var(envvar::ENV).unwrap_or_else(|_| "development".to_string());
    let default_filter = if profile == "production" { "info" } else { "debug" };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn bin_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn mode(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    let config_path = args
        .config
        .unwrap_or_else(|| defaults::default_config_dir().join("config.yaml"));
    let schema_path = args
        .schema
        .unwrap_or_else(|| defaults::default_config_dir().join("syn4pse.v1.schema.json"));

    let shutdown = CancellationToken::new();
    let manager = Arc::new(model::Manager::new());

    // Reloads re-run model reconciliation on the runtime; failed reloads
    // keep the previous snapshot and are only logged.
    let reload_manager = manager.clone();
    let reload_cancel = shutdown.clone();
    let handle = tokio::runtime::Handle::current();
    let watcher = Watcher::new(
        &config_path,
        &schema_path,
        Box::new(move |result| {
            let cfg = match result {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::error!(error = %e, "config reload failed, keeping previous snapshot");
                    return;
                }
            };
            let manager = reload_manager.clone();
            let cancel = reload_cancel.clone();
            handle.spawn(async move {
                if let Err(e) = manager.load_models_from_config(&cancel, &cfg).await {
                    tracing::error!(error = %e, "failed to load models from config");
                }
            });
        }),
    )?;

    let cfg = watcher.snapshot();
    manager.load_models_from_config(&shutdown, &cfg).await?;
    tracing::info!(
        config = %config_path.display(),
        schema = %schema_path.display(),
        "config loaded"
    );

    let server_manager = Arc::new(ServerManager::new());
    let backends = Arc::new(Registry::new());

    match mode(envvar::LLM_MODE, "cli").as_str() {
        "server" => {
            let bin = bin_path(envvar::LLAMA_SERVER_BIN, "./bin/llama-server");
            backends
                .register(Arc::new(llama::ServerBackend::new(bin, server_manager.clone())))
                .await?;
            tracing::info!("registered llama.cpp backend (server mode)");
        }
        _ => {
            let bin = bin_path(envvar::LLAMA_CLI_BIN, "./bin/llama-cli");
            backends
                .register(Arc::new(llama::CliBackend::new(bin)?))
                .await?;
            tracing::info!("registered llama.cpp backend (cli mode)");
        }
    }

    match mode(envvar::STT_MODE, "server").as_str() {
        "cli" => {
            let bin = bin_path(envvar::WHISPER_CLI_BIN, "./bin/whisper-cli");
            backends
                .register(Arc::new(whisper::CliBackend::new(bin)?))
                .await?;
            tracing::info!("registered whisper.cpp backend (cli mode)");
        }
        _ => {
            let bin = bin_path(envvar::WHISPER_SERVER_BIN, "./bin/whisper-server");
            backends
                .register(Arc::new(whisper::ServerBackend::new(bin, server_manager.clone())))
                .await?;
            tracing::info!("registered whisper.cpp backend (server mode)");
        }
    }

    let piper_bin = bin_path(envvar::PIPER_BIN, "./bin/piper");
    backends
        .register(Arc::new(piper::PiperBackend::new(piper_bin)?))
        .await?;
    tracing::info!("registered piper backend");

    let state = Arc::new(AppState::new(backends.clone(), manager.clone()));
    let app = Router::new()
        .nest("/v1", api::router())
        .route("/health", get(api::health::health))
        .layer(middleware::from_fn(logging::request_logger))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.http_port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, grpc_port = args.grpc_port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    if let Err(e) = backends.close().await {
        tracing::error!(error = %e, "failed to close backends");
    }
    server_manager.stop_all().await;

    // Keep the watcher (and its snapshot) alive for the whole run.
    drop(watcher);

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    cancel.cancel();
}
