use crate::context::load_config;
use crate::error::{CliError, CliResult};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

/// Inspect allocator configuration
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show {
        /// Config file to merge over the defaults
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Check a config file without running anything
    Validate {
        /// Config file to check
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn handle_config_command(cmd: &ConfigCommands) -> CliResult {
    match cmd {
        ConfigCommands::Show { config } => {
            let config = load_config(config.as_deref())?;
            let rendered =
                toml::to_string_pretty(&config).map_err(|e| CliError::Serialize(e.to_string()))?;
            println!("{}", rendered);
        }
        ConfigCommands::Validate { config } => {
            load_config(Some(config.as_path()))?;
            println!("{} {} is valid", "✓".green(), config.display());
        }
    }
    Ok(())
}
