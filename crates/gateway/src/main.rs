use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hub_domain::config::HubConfig;
use hub_gateway::http::build_router;
use hub_gateway::state::AppState;

#[derive(Parser)]
#[command(name = "agenthub", about = "Agent orchestration hub", version)]
struct Cli {
    /// Path to the hub configuration file.
    #[arg(long, global = true, default_value = "hub.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub server (default).
    Serve,
    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Validate the configuration file and exit non-zero on problems.
    Validate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hub_gateway=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = HubConfig::load(&cli.config).context("loading configuration")?;
            config.validate().context("validating configuration")?;
            run_server(config).await
        }
        Some(Command::Config {
            command: ConfigCommand::Validate,
        }) => {
            let config = HubConfig::load(&cli.config)?;
            match config.validate() {
                Ok(()) => {
                    println!("configuration ok");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("configuration error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Some(Command::Version) => {
            println!("agenthub {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_server(config: HubConfig) -> anyhow::Result<()> {
    if config.auth_token.is_none() {
        tracing::warn!("no auth_token configured; every client will be refused");
    }

    let bind: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("parsing listen address")?;
    let tls_configured = config.server.tls.is_some();

    let state = AppState::build(config)?;
    let shutdown = tokio_util::sync::CancellationToken::new();
    let background = state.spawn_background_tasks(shutdown.clone());

    let router = build_router(state.clone())
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(
        addr = %bind,
        tls = tls_configured,
        "hub listening (TLS termination, when used, sits in front of this listener)"
    );

    let shutdown_signal = shutdown.clone();
    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    serve.await.context("server error")?;

    // Stop runners so every agent persists its last snapshot.
    state.agents.shutdown_all().await;
    for task in background {
        task.abort();
    }
    tracing::info!("hub stopped");
    Ok(())
}
