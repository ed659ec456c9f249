//! # mesh
//!
//! Command relay binary: `mesh serve` runs the coordinator, `mesh agent`
//! runs a relay agent next to a local HTTP API.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mesh_agent::{AgentConfig, AgentRunner, Executor};
use mesh_server::{InsecureVerifier, JwtVerifier, ServerConfig, TokenVerifier};
use mesh_settings::MeshSettings;
use mesh_telemetry::{init_telemetry, TelemetryConfig};
use secrecy::SecretString;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "mesh", about = "Command relay between a coordinator and remote agents")]
struct Cli {
    /// Settings file (defaults to `~/.mesh/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator.
    Serve {
        /// Port to bind (overrides settings; 0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a relay agent.
    Agent {
        /// Skip the connectivity probe and assume the host is always online.
        #[arg(long, default_value_t = false)]
        no_probe: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = match cli.config {
        Some(ref path) => mesh_settings::load_settings_from_path(path),
        None => mesh_settings::load_settings(),
    }
    .context("failed to load settings")?;

    let json_default = matches!(cli.command, Command::Serve { .. });
    let logging = &settings.logging;
    init_telemetry(&TelemetryConfig::from_names(
        &logging.level,
        logging.modules.iter().map(|(m, l)| (m.as_str(), l.as_str())),
        logging.json.unwrap_or(json_default),
    ))?;

    match cli.command {
        Command::Serve { port } => serve(settings, port).await,
        Command::Agent { no_probe } => agent(settings, no_probe).await,
    }
}

async fn serve(settings: MeshSettings, port: Option<u16>) -> Result<()> {
    let verifier: Arc<dyn TokenVerifier> = match settings.server.jwt_secret {
        Some(ref secret) => Arc::new(JwtVerifier::new(&SecretString::from(secret.clone()))),
        None if settings.server.allow_insecure_tokens => {
            tracing::warn!("no JWT secret configured, accepting raw tokens as identities");
            Arc::new(InsecureVerifier)
        }
        None => anyhow::bail!(
            "server.jwtSecret is not set; set it or enable server.allowInsecureTokens for development"
        ),
    };

    let mut config = ServerConfig::from(&settings.server);
    if let Some(port) = port {
        config.port = port;
    }
    let handle = mesh_server::start(config, verifier)
        .await
        .context("failed to start coordinator")?;
    tracing::info!(port = handle.port, "coordinator ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn agent(settings: MeshSettings, no_probe: bool) -> Result<()> {
    let config = AgentConfig::from(&settings.agent);
    let shutdown = CancellationToken::new();

    if settings.agent.token.is_none() {
        tracing::warn!("no agent token configured, waiting idle");
    }
    let (_token_tx, token_rx) = watch::channel(settings.agent.token.clone().map(SecretString::from));

    let (_online_tx, online_rx) = watch::channel(true);
    let online_rx = if no_probe {
        online_rx
    } else {
        mesh_agent::spawn_connectivity_probe(
            config.connectivity_probe_target.clone(),
            config.connectivity_probe_interval,
            shutdown.clone(),
        )
    };

    let handler = Arc::new(Executor::from_config(&config));
    let runner = AgentRunner::new(config, handler);

    let run = runner.run(token_rx, online_rx, shutdown.clone());
    tokio::pin!(run);
    tokio::select! {
        () = &mut run => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl+c")?;
            tracing::info!("shutting down");
            shutdown.cancel();
            run.await;
        }
    }
    Ok(())
}
