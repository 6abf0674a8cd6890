//! Aggregator node agent
//!
//! Keeps the syslog collector and log shipper on this host converged to the
//! control plane's desired state, and reports liveness while they are healthy.
//!
//! ## Architecture
//!
//! - **Live Channel**: receives pushed flag updates over a WebSocket
//! - **Sync Loop**: pulls the desired config hourly as a fallback
//! - **Monitor Loop**: checks health, restarts with backoff, sends heartbeats
//! - **Process Manager**: drives the services through docker compose

use std::path::PathBuf;
use std::sync::Arc;

use aggregator_agent::config::is_truthy;
use aggregator_agent::{Agent, ComposeProcessManager, Config, TemplateRenderer};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Aggregator node agent.
#[derive(Debug, Parser)]
#[command(name = "aggregator-agent", version, about)]
struct Args {
    /// Environment file loaded before reading configuration.
    #[arg(long, env = "AGENT_ENV_FILE", default_value = ".env")]
    env_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Loaded before the subscriber exists, so the outcome is logged below.
    let env_file = dotenvy::from_path(&args.env_file);

    // DEBUG is read directly so configuration warnings reach the subscriber.
    let debug = std::env::var("DEBUG").is_ok_and(|v| is_truthy(&v));
    let default_filter = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting aggregator agent");

    match env_file {
        Ok(()) => info!(path = %args.env_file.display(), "Loaded environment file"),
        Err(e) => warn!(path = %args.env_file.display(), error = %e, "Environment file not loaded"),
    }

    let config = Config::from_env().context("invalid configuration")?;
    info!(
        aggregator = %config.identity.name,
        sync_url = %config.endpoints.sync_url,
        live_update_host = %config.endpoints.live_update_host,
        skip_verify_tls = config.skip_verify_tls,
        targets = config.elasticsearch_targets.len(),
        "Configuration loaded"
    );

    let process = Arc::new(
        ComposeProcessManager::new(&config.compose_project, &config.logship_network)
            .context("failed to prepare compose workspace")?,
    );
    info!(workdir = %process.root().display(), "Compose workspace ready");

    let agent = Agent::new(&config, process, Arc::new(TemplateRenderer::new()))?;
    agent.run().await
}
