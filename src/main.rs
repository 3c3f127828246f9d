use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Module declarations with feature gates
#[cfg(feature = "cli")]
mod cli;

#[cfg(feature = "backend")]
mod db;
#[cfg(feature = "backend")]
mod server;

#[cfg(feature = "cli")]
use cli::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Backend server commands
    #[command(subcommand)]
    Backend(backend::BackendCommands),
    /// Inspect and abort template builds running on this host
    #[command(subcommand)]
    #[command(visible_alias = "t")]
    Templates(templates::TemplateCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for all commands
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Backend(cmd) => backend::handle_backend_command(cmd).await,
        Commands::Templates(cmd) => templates::handle_template_command(cmd).await,
    }
}
