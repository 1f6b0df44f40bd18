use clap::{Parser, Subcommand};

pub mod config;
pub mod logging;
pub mod simulate;
pub mod version;

#[derive(Parser)]
#[command(name = "subgate")]
#[command(author = "Subgate Project")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator CLI for the subscription verification gate", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a commented default configuration file
    InitConfig {
        /// Guild (server) ID this gate serves
        #[arg(long)]
        guild: u64,

        /// Path to config file (default: ~/.config/subgate/config.toml)
        #[arg(long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Path to config file (default: ~/.config/subgate/config.toml)
        #[arg(long)]
        config: Option<String>,
    },

    /// Replay a JSON-lines scenario against an in-memory guild
    Simulate {
        /// Scenario file, one event per line
        #[arg(long)]
        scenario: String,

        /// Path to config file (default: ~/.config/subgate/config.toml)
        #[arg(long)]
        config: Option<String>,
    },

    /// Display version information
    Version,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::InitConfig { guild, path, force } => config::init(guild, path, force),
        Commands::CheckConfig { config } => config::check(config),
        Commands::Simulate { scenario, config } => simulate::execute(scenario, config).await,
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}
