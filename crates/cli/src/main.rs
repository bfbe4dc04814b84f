//! AgentRail CLI: the main entry point.
//!
//! Commands:
//! - `run`     Run one task to completion, rendering live progress
//! - `serve`   Start the HTTP gateway
//! - `stop`    Stop a session (or everything) on a running gateway
//! - `init`    Write a default config file
//! - `config`  Show, locate or validate the configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "agentrail",
    about = "AgentRail: supervised agent runs with live progress and an emergency stop",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single task and print the final answer
    Run {
        /// The task for the agent
        #[arg(short, long)]
        message: String,

        /// Continue a stored conversation
        #[arg(short, long)]
        conversation: Option<String>,
    },

    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Stop a running session on the gateway, or every session
    Stop {
        /// Session to stop; omit for an emergency stop of everything
        #[arg(short, long)]
        session: Option<String>,

        /// Gateway base URL (defaults to the configured host and port)
        #[arg(long, env = "AGENTRAIL_GATEWAY_URL")]
        url: Option<String>,
    },

    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config with secrets redacted
    Show,
    /// Print the config file path
    Path,
    /// Check the config for errors and risky settings
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { message, conversation } => commands::run::run(message, conversation).await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Stop { session, url } => commands::stop::run(session, url).await?,
        Commands::Init { force } => commands::init::run(force).await?,
        Commands::Config { action } => match action.unwrap_or(ConfigAction::Show) {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
        },
    }

    Ok(())
}
