use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drover_harness::HarnessConfig;

mod commands;
mod error;
mod output;

use commands::*;
use output::{OutputFormat, OutputManager};

#[derive(Parser)]
#[command(name = "droverctl")]
#[command(about = "Drover CLI - run benchmarks and cluster operations, check their reports")]
#[command(version)]
#[command(long_about = "
droverctl drives long-running work against a serving cluster and reports
parameterized, comparable results.

Examples:
  droverctl feed --target https://container:4443/ --feed-file docs.json --size 10
  droverctl reindex --url http://config:19071/application/v2/tenant/default/... --documents 2000000
  droverctl check-graphs --reports results/reports.jsonl --bounds bounds.toml
  droverctl config show
")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "table")]
    format: OutputFormatArg,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum OutputFormatArg {
    Table,
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Table => OutputFormat::Table,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one feed benchmark and report its metrics
    Feed(FeedArgs),

    /// Trigger a reindexing and wait for it to finish
    Reindex(ReindexArgs),

    /// Check stored reports against historic bounds
    CheckGraphs(CheckGraphsArgs),

    /// Inspect harness configuration
    Config(ConfigArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(&cli);

    if let Err(e) = run_command(cli).await {
        eprintln!("{}", error::format_error(&e));
        process::exit(error::exit_code(&e));
    }
}

async fn run_command(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let output = OutputManager::new(cli.format.into(), !cli.no_color);

    match cli.command {
        Commands::Feed(args) => feed::run(args, config, output).await,
        Commands::Reindex(args) => reindex::run(args, config, output).await,
        Commands::CheckGraphs(args) => graphs::run(args, output),
        Commands::Config(args) => config::run(args, config, cli.config.as_deref(), output),
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else if cli.verbose {
        tracing::Level::INFO
    } else if cli.quiet {
        tracing::Level::ERROR
    } else {
        tracing::Level::WARN
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("droverctl={level},drover_harness={level}", level = log_level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    debug!("Drover CLI started");
}

fn load_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let config = HarnessConfig::load_from_file(path)
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            info!("Loaded configuration from: {}", path.display());
            config
        }
        None => HarnessConfig::default(),
    };

    config.apply_env().context("Invalid DROVER_* environment variable")?;
    config.validate()?;
    Ok(config)
}
