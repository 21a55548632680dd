//! trickled — serve streamed pages.
//!
//! # Usage
//!
//! ```text
//! trickled serve --config trickle.toml --port 8080
//! trickled check-config trickle.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trickle_core::TrickleConfig;
use trickled::{AppState, build_router, demo};

const DEFAULT_FILTER: &str = "info,trickled=debug,trickle_render=debug";

#[derive(Parser)]
#[command(name = "trickled", about = "Trickle streaming page server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the demo pages.
    Serve {
        /// Path to trickle.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on; overrides the config file.
        #[arg(long)]
        port: Option<u16>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Parse a config file and print the effective settings.
    CheckConfig {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Command::CheckConfig { path } => {
            let config = TrickleConfig::from_file(&path)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TrickleConfig> {
    match path {
        Some(path) => {
            let config = TrickleConfig::from_file(path)?;
            info!(path = ?path, "config loaded");
            Ok(config)
        }
        None => Ok(TrickleConfig::default()),
    }
}

async fn serve(config: TrickleConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(
        timeout_ms = config.render.timeout_ms,
        late_arrival_timeout_ms = config.render.late_arrival_timeout_ms,
        "trickled starting"
    );

    let state = AppState::new(config, demo::routes());
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => {
                    warn!(error = %e, "failed to install ctrl-c handler");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    info!("trickled stopped");
    Ok(())
}
