//! AGI Monitor CLI
//!
//! Operator tool for probing a monitor, dry-running sizing decisions
//! against a captured event, and inspecting member auth headers.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{auth, health, plan};

/// AGI Monitor CLI
#[derive(Parser)]
#[command(name = "agimon")]
#[command(author, version, about = "CLI for the AGI Monitor", long_about = None)]
pub struct Cli {
    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe a monitor's health endpoint
    Health {
        /// Monitor base URL (can also be set via AGIMON_URL env var)
        #[arg(long, env = "AGIMON_URL", default_value = "https://localhost")]
        url: String,

        /// Verify the monitor's TLS certificate
        #[arg(long)]
        strict_tls: bool,
    },

    /// Run the sizing engine offline against a captured event
    Plan(plan::PlanArgs),

    /// Decode an Agi-Monitor-Auth header value
    DecodeAuth {
        /// Header value (base64 JSON claims)
        header: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Health { url, strict_tls } => {
            let client = client::MonitorClient::new(&url, strict_tls)?;
            health::check_health(&client, cli.format, cli.verbose).await?;
        }
        Commands::Plan(args) => {
            plan::run_plan(&args, cli.format, cli.verbose)?;
        }
        Commands::DecodeAuth { header } => {
            auth::decode_auth(&header, cli.format)?;
        }
    }

    Ok(())
}
