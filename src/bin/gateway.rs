//! Gateway CLI entry point
//!
//! `gateway <ws_port> [--discover | host:port ...]`: agents come either
//! from UDP discovery or from a fixed list; one of the two must be
//! given. Exit code 1 on argument or initialization errors.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use remote_agent::gateway::backend::BackendSource;
use remote_agent::gateway::discovery::{AgentAddr, DiscoveryTable};
use remote_agent::gateway::Gateway;
use remote_agent::config::GatewayConfig;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gateway")]
#[command(about = "WebSocket fan-out gateway multiplexing clients and agents")]
#[command(version)]
struct Cli {
    /// WebSocket listen port
    ws_port: u16,

    /// Discover agents via UDP announcements instead of a fixed list
    #[arg(long)]
    discover: bool,

    /// Fixed agent list as host:port pairs
    #[arg(value_name = "HOST:PORT")]
    agents: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_agent_addr(text: &str) -> Result<AgentAddr> {
    let (host, port) = text
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected host:port, got '{text}'"))?;
    if host.is_empty() {
        bail!("empty host in '{text}'");
    }
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid port in '{text}'"))?;
    Ok(AgentAddr {
        host: host.to_string(),
        port,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    let source = if cli.discover {
        if !cli.agents.is_empty() {
            bail!("--discover and a fixed agent list are mutually exclusive");
        }
        info!("discovery mode enabled");
        BackendSource::Discovery(Arc::new(DiscoveryTable::new()))
    } else {
        if cli.agents.is_empty() {
            bail!("no agents specified; pass --discover or host:port pairs");
        }
        let addrs = cli
            .agents
            .iter()
            .map(|a| parse_agent_addr(a))
            .collect::<Result<Vec<_>>>()?;
        for addr in &addrs {
            info!(host = %addr.host, port = addr.port, "configured agent");
        }
        BackendSource::Static(addrs)
    };

    let config = GatewayConfig {
        ws_port: cli.ws_port,
        ..Default::default()
    };
    config.validate()?;

    Gateway::new(config).run(source).await
}
