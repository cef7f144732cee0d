//! adsel - on-device ad auction runner
//!
//! Runs auctions described in JSON against real bidding and scoring scripts,
//! and probes scripts for the entry points an auction needs.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

/// adsel - on-device ad auction runner
#[derive(Parser, Debug)]
#[command(name = "adsel")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the engine configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one auction and print its outcome
    Run(commands::run::RunArgs),

    /// Check that a script defines every given entry point
    Validate(commands::script::ValidateArgs),

    /// Print the declared parameter count of a script function
    Arity(commands::script::ArityArgs),

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => {
            // Exit 0 only when the auction produced a winner.
            let exit_code = commands::run::run(&config, &args);
            std::process::exit(i32::from(exit_code));
        },
        Commands::Validate(args) => commands::script::validate(&config, &args),
        Commands::Arity(args) => commands::script::arity(&config, &args),
        Commands::Config => commands::config::show(&config),
    }
}
