//! Agent CLI entry point

use anyhow::Result;
use clap::Parser;
use remote_agent::agent::Agent;
use remote_agent::config::AgentConfig;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "agent")]
#[command(about = "Remote monitoring agent: capture, control and discovery")]
#[command(version)]
struct Cli {
    /// Control port; the data channel uses port + 1.
    port: Option<u16>,

    /// Path to configuration file
    #[arg(short, long, default_value = "agent.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
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

    let mut config = if std::path::Path::new(&cli.config).exists() {
        info!(config_path = %cli.config, "loading configuration");
        AgentConfig::load(&cli.config)?
    } else {
        AgentConfig::default()
    };

    if let Some(port) = cli.port {
        config.port = port;
        info!(port, "overriding control port");
    }
    config.validate()?;

    Agent::new(config).run().await
}
