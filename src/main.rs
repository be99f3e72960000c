// src/main.rs
// torbo - local personal-AI gateway

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use torbo::config::{GatewayConfig, Secrets};
use torbo::web::create_router;
use torbo::web::state::AppState;

#[derive(Parser)]
#[command(name = "torbo", version, about = "Local personal-AI gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server
    Serve {
        /// Bind host (overrides BIND_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides TORBO_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from ~/.torbo/.env only (never from CWD - an untrusted
    // directory could override the master token or API keys)
    if let Some(home) = dirs::home_dir() {
        let _ = dotenvy::from_path(home.join(".torbo/.env"));
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TORBO_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        None | Some(Commands::Serve { host: None, port: None }) => serve(None, None).await,
        Some(Commands::Serve { host, port }) => serve(host, port).await,
    }
}

async fn serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = GatewayConfig::load();
    if let Some(host) = host {
        config.bind_host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let addr = format!("{}:{}", config.bind_host, config.port);
    let state = AppState::new(config, Secrets::from_env());
    let router = create_router(state.clone());

    // Bind failure is fatal: report and exit non-zero
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(addr = %addr, version = env!("CARGO_PKG_VERSION"), "Gateway listening");

    state.events.publish(
        "system.gateway.started",
        HashMap::from([("addr".to_string(), addr.clone())]),
        "main",
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    state
        .events
        .publish("system.gateway.stopped", HashMap::new(), "main");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
