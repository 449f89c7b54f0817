use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use drover_harness::HarnessConfig;

use crate::error::CliError;
use crate::output::{OutputFormat, OutputManager};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration, including environment overrides
    Show,

    /// Validate a configuration file
    Validate {
        /// File to validate (defaults to --config)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Write a configuration file with default values
    Init {
        /// Destination file
        #[arg(default_value = "drover.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn run(
    args: ConfigArgs,
    config: HarnessConfig,
    config_path: Option<&Path>,
    output: OutputManager,
) -> Result<()> {
    match args.action {
        ConfigAction::Show => show(&config, config_path, &output),
        ConfigAction::Validate { file } => {
            let file = file
                .as_deref()
                .or(config_path)
                .ok_or_else(|| CliError::InvalidArgument("no configuration file given".to_string()))?;
            validate(file, &output)
        }
        ConfigAction::Init { path, force } => init(&path, force, &output),
    }
}

fn show(config: &HarnessConfig, config_path: Option<&Path>, output: &OutputManager) -> Result<()> {
    match output.format() {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Table => {
            match config_path {
                Some(path) => output.print_info(&format!("Configuration from {}", path.display())),
                None => output.print_info("Default configuration"),
            }
            print!("{}", config.to_toml()?);
        }
    }
    Ok(())
}

fn validate(file: &Path, output: &OutputManager) -> Result<()> {
    HarnessConfig::load_from_file(file)
        .with_context(|| format!("Invalid config file {}", file.display()))?;
    output.print_success(&format!("{} is valid", file.display()));
    Ok(())
}

fn init(path: &Path, force: bool, output: &OutputManager) -> Result<()> {
    if path.exists() && !force {
        return Err(CliError::InvalidArgument(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ))
        .into());
    }
    HarnessConfig::default()
        .save_to_file(path)
        .with_context(|| format!("Cannot write {}", path.display()))?;
    output.print_success(&format!("Wrote default configuration to {}", path.display()));
    Ok(())
}
