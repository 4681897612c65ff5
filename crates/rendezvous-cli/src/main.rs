//! Rendezvous server CLI
//!
//! NAT traversal rendezvous with UDP fallback relay

mod config;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use rendezvous_broker::Server;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use config::Config;

/// Rendezvous - peer introduction and relay for NAT'd peers
#[derive(Parser)]
#[command(name = "rendezvous")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous server (default)
    Serve,

    /// Validate the configuration and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config).await?,
        Commands::CheckConfig => check_config(&config)?,
    }

    Ok(())
}

/// Run the server until Ctrl+C
async fn serve(config: &Config) -> anyhow::Result<()> {
    if let Some(addr) = config.metrics_addr()? {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!(%addr, "Prometheus exporter listening");
    }

    let server = Server::bind(config.server_config()?).await?;
    println!("Control channel:  {}", server.control_addr());
    println!("Registrar:        {}", server.registrar_addr());
    println!("Relay ports:      {}", config.relay.ports);
    println!("Press Ctrl+C to stop");

    server.run_until(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

/// Print the validated configuration
fn check_config(config: &Config) -> anyhow::Result<()> {
    let server = config.server_config()?;
    println!("Configuration OK");
    println!();
    print!("{}", toml::to_string_pretty(config)?);
    println!();
    println!("Relay capacity: {} ports", server.relay.ports.capacity());
    Ok(())
}
