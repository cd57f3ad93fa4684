//! intentmesh command-line tool
//!
//! Runs the resource allocator against JSON registry and request files.

mod commands;
mod context;
mod error;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    handle_allocate_command, handle_config_command, handle_scan_command, AllocateArgs,
    ConfigCommands, ScanArgs,
};

#[derive(Parser, Debug)]
#[command(name = "intentmesh", author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Allocate resources for a plan and dispatch it
    Allocate(AllocateArgs),

    /// Report per-step feasibility against a registry
    Scan(ScanArgs),

    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match &cli.command {
        Commands::Allocate(args) => handle_allocate_command(args).await?,
        Commands::Scan(args) => handle_scan_command(args).await?,
        Commands::Config(cmd) => handle_config_command(cmd)?,
    }

    Ok(())
}
