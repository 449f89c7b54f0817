use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tracing::info;

use drover_harness::{
    ApplicationClient, ConvergenceWaiter, HarnessConfig, LocalExecutor, PollSchedule,
    ReindexingEndpoint, ScenarioContext,
};

use crate::error::CliError;
use crate::output::OutputManager;

#[derive(Args, Debug)]
pub struct ReindexArgs {
    /// Application URL on the config server
    #[arg(long, env = "DROVER_APPLICATION_URL")]
    pub url: String,

    /// Documents in the corpus, used for throughput
    #[arg(long)]
    pub documents: u64,

    /// Legend parameter identifying this kind of run
    #[arg(long, default_value = "reindex")]
    pub legend: String,

    /// Wait for services to converge on this config generation first
    #[arg(long)]
    pub generation: Option<i64>,

    /// Seconds allowed for convergence
    #[arg(long, default_value = "60")]
    pub convergence_timeout: u64,

    /// Seconds allowed for the operation to start (overrides configuration)
    #[arg(long)]
    pub start_timeout: Option<u64>,

    /// Seconds allowed for the whole operation (overrides configuration)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Append the report as a JSON line to this file
    #[arg(long)]
    pub report_file: Option<PathBuf>,
}

pub async fn run(args: ReindexArgs, mut config: HarnessConfig, output: OutputManager) -> Result<()> {
    if let Some(secs) = args.start_timeout {
        config.polling.start_timeout_secs = secs;
    }
    if let Some(secs) = args.timeout {
        config.polling.operation_timeout_secs = secs;
    }
    config.validate()?;
    if args.documents == 0 {
        return Err(CliError::InvalidArgument("--documents must be greater than 0".to_string()).into());
    }

    let client = ApplicationClient::new(&args.url)?;

    if let Some(generation) = args.generation {
        let schedule = PollSchedule::from_settings(
            &config.polling,
            Duration::from_secs(args.convergence_timeout),
        );
        let spinner = output.create_spinner(&format!("Waiting for generation {}", generation));
        let converged = ConvergenceWaiter::new(Arc::new(client.clone()))
            .with_schedule(schedule)
            .wait(generation)
            .await;
        spinner.finish_and_clear();
        let elapsed = converged?;
        output.print_info(&format!(
            "Services converged on generation {} after {:.1}s",
            generation,
            elapsed.as_secs_f64()
        ));
    }

    let mut ctx = ScenarioContext::new("reindex", config, Arc::new(LocalExecutor::new()))?;
    let mut poller = ctx.poller(Arc::new(ReindexingEndpoint::new(client)));

    info!("Triggering reindexing through {}", args.url);
    let spinner = output.create_spinner("Reindexing");
    let result = poller.run().await;
    spinner.finish_and_clear();
    let operation = result?;

    let filler = operation.result_filler(args.documents, &args.legend)?;
    let report = ctx.write_report(vec![filler]);
    output.print_report(report)?;
    output.print_success(&format!(
        "Reindexed {} documents in {:.3} seconds",
        args.documents,
        operation.duration_millis() as f64 * 1e-3
    ));

    if let Some(path) = &args.report_file {
        ctx.flush(path)?;
        output.print_info(&format!("Report appended to {}", path.display()));
    }

    Ok(())
}
