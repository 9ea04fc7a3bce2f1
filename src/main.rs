//! relay-agent
//!
//! Connects to a relay endpoint and echoes every inbound message back to the
//! sender until interrupted. With `--ping`, pings the endpoint once and exits.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_agent::{AgentConfig, AgentState, RelayAgent};

#[derive(Parser, Debug)]
#[command(name = "relay-agent")]
#[command(about = "Echo relay agent for framed TCP endpoints")]
struct Args {
    /// Endpoint address, e.g. tcp://127.0.0.1:7400 (falls back to RELAY_ENDPOINT)
    #[arg(long)]
    endpoint: Option<String>,

    /// JSON config file (overridden by flags)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Connect and ping timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// How long to wait for the listener on shutdown, in seconds
    #[arg(long)]
    shutdown_timeout_secs: Option<u64>,

    /// Ping the endpoint every N seconds while running
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_secs: Option<u64>,

    /// Ping once and exit
    #[arg(long)]
    ping: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn agent_config(&self) -> Result<AgentConfig> {
        let mut config = if let Some(path) = &self.config {
            AgentConfig::from_path(path)?
        } else if let Some(endpoint) = &self.endpoint {
            AgentConfig::new(endpoint.clone())
        } else {
            AgentConfig::from_env()?
        };

        if let (Some(endpoint), Some(_)) = (&self.endpoint, &self.config) {
            config.endpoint.clone_from(endpoint);
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.shutdown_timeout_secs {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.agent_config().context("Failed to load configuration")?;
    let agent = RelayAgent::new(config).context("Failed to create relay agent")?;

    info!(endpoint = %agent.endpoint(), "Loaded configuration");

    agent.start().await.context("Failed to start relay agent")?;

    if args.ping {
        let result = agent.ping().await;
        agent.stop().await?;
        let rtt = result.context("Ping failed")?;
        info!(rtt = ?rtt, "Endpoint is reachable");
        return Ok(());
    }

    run_until_interrupted(&agent, args.heartbeat_secs.map(Duration::from_secs)).await;
    agent.stop().await?;
    Ok(())
}

/// Wait for Ctrl-C, pinging on `heartbeat` if set, or until the connection drops.
async fn run_until_interrupted(agent: &RelayAgent, heartbeat: Option<Duration>) {
    let mut ticker = tokio::time::interval(heartbeat.unwrap_or(Duration::from_secs(1)));
    ticker.tick().await; // First tick is immediate, skip it

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Interrupted, shutting down");
                return;
            }
            _ = ticker.tick() => {
                if agent.state() == AgentState::Stopped {
                    warn!("Connection lost, exiting");
                    return;
                }
                if heartbeat.is_some() {
                    match agent.ping().await {
                        Ok(rtt) => info!(rtt = ?rtt, "Heartbeat"),
                        Err(e) => warn!(error = %e, "Heartbeat failed"),
                    }
                }
            }
        }
    }
}
