use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::info;

use drover_harness::report::parameter_filler;
use drover_harness::session::DEFAULT_ROUTE;
use drover_harness::{
    FeedCommand, HarnessConfig, LocalExecutor, NoopSampler, RemoteExecutor, ResourceSampler,
    ScenarioContext, SshExecutor,
};

use crate::error::CliError;
use crate::output::OutputManager;

#[derive(Args, Debug)]
pub struct FeedArgs {
    /// Host running the feed client
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Reach the host over ssh instead of the local shell
    #[arg(long)]
    pub ssh: bool,

    /// Directory on the host receiving the client's stdout/stderr files
    #[arg(long)]
    pub remote_dir: Option<String>,

    /// Endpoint the feed client sends documents to
    #[arg(long)]
    pub target: String,

    /// Feed file on the host
    #[arg(long)]
    pub feed_file: String,

    /// Document size in bytes, reported as the `size` parameter
    #[arg(long, default_value = "0")]
    pub size: usize,

    /// Number of client connections
    #[arg(long, default_value = "32")]
    pub connections: u32,

    /// Document route
    #[arg(long, default_value = DEFAULT_ROUTE)]
    pub route: String,

    /// Feed client program
    #[arg(long, default_value = "vespa")]
    pub program: String,

    /// Extra environment for the feed client (KEY=VALUE)
    #[arg(long, value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Extra report parameters (KEY=VALUE)
    #[arg(long = "param", value_parser = parse_env)]
    pub parameters: Vec<(String, String)>,

    /// Skip CPU and memory sampling
    #[arg(long)]
    pub no_sampling: bool,

    /// Ceiling for the feed run in seconds (overrides configuration)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Append the report as a JSON line to this file
    #[arg(long)]
    pub report_file: Option<PathBuf>,
}

fn parse_env(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}

pub async fn run(args: FeedArgs, mut config: HarnessConfig, output: OutputManager) -> Result<()> {
    if let Some(timeout) = args.timeout {
        if timeout == 0 {
            return Err(CliError::InvalidArgument("--timeout must be greater than 0".to_string()).into());
        }
        config.process.wait_timeout_secs = timeout;
    }

    let executor: Arc<dyn RemoteExecutor> = if args.ssh {
        Arc::new(SshExecutor::new())
    } else {
        Arc::new(LocalExecutor::new())
    };
    let mut ctx = ScenarioContext::new("feed", config, executor)?;

    let sampler: Arc<dyn ResourceSampler> = if args.no_sampling {
        Arc::new(NoopSampler)
    } else if args.ssh {
        ctx.remote_sampler()
    } else {
        ctx.system_sampler()
    };

    let mut session = ctx.session(&args.host, sampler);
    if let Some(dir) = &args.remote_dir {
        session = session.with_output_dir(dir);
    } else if args.ssh {
        session = session.with_output_dir(".");
    }

    let mut feed = FeedCommand::new(&args.target, &args.feed_file)
        .program(&args.program)
        .connections(args.connections)
        .route(&args.route)
        .document_size(args.size);
    for (key, value) in &args.env {
        feed = feed.env(key, value);
    }

    let fillers = args
        .parameters
        .iter()
        .map(|(key, value)| parameter_filler(key.as_str(), value.as_str()))
        .collect();

    info!("Feeding {} to {} from {}", args.feed_file, args.target, args.host);
    let spinner = output.create_spinner(&format!("Running {} on {}", args.program, args.host));
    let result = session.run(&feed, fillers).await;
    spinner.finish_and_clear();
    let record = result?;

    let throughput = record.metric_f64("feeder.throughput");
    let report = ctx.write_report(vec![record.into_filler()]);
    output.print_report(report)?;
    if let Some(throughput) = throughput {
        output.print_success(&format!("Fed at {:.1} documents/s", throughput));
    }

    if let Some(path) = &args.report_file {
        ctx.flush(path)?;
        output.print_info(&format!("Report appended to {}", path.display()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        assert_eq!(
            parse_env("VESPA_CLI_HOME=/tmp/a=b").unwrap(),
            ("VESPA_CLI_HOME".to_string(), "/tmp/a=b".to_string())
        );
        assert!(parse_env("=x").is_err());
        assert!(parse_env("novalue").is_err());
    }
}
