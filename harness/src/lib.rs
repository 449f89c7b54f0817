//! Drover: supervision and metrics collection for cluster benchmarks
//!
//! This crate drives a remote serving cluster through long-running work and
//! turns the results into comparable reports:
//!
//! - Launching external benchmark processes and awaiting them with a deadline
//! - Sampling host resources while a benchmark runs
//! - Triggering cluster operations and polling them to a terminal state
//! - Composing report records from fillers and checking historic bounds

pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod operation;
pub mod poll;
pub mod process;
pub mod remote;
pub mod report;
pub mod sampler;
pub mod session;

pub use cluster::{ApplicationClient, ConvergenceSource, ConvergenceWaiter, ReindexingEndpoint};
pub use config::HarnessConfig;
pub use context::ScenarioContext;
pub use error::{HarnessError, Phase, Result};
pub use operation::{
    OperationEndpoint, OperationHandle, OperationPoller, OperationReport, OperationState,
    OperationStatus, PollerState,
};
pub use poll::{poll_until, PollError, PollSchedule};
pub use process::{ExternalProcessRunner, ProcessHandle, ProcessOutcome};
pub use remote::{CommandOutput, LocalExecutor, RemoteExecutor, ShellCommand, SshExecutor};
pub use report::{
    json_to_filler, metric_filler, parameter_filler, BoxedFiller, GraphSpec, MetricSample,
    MetricsReport, ReportFiller, ReportRecord, ReportValue,
};
pub use sampler::{NoopSampler, RemoteSampler, ResourceSampler, SystemSampler};
pub use session::{BenchmarkSession, CommandBuilder, FeedCommand, OutputFormat};

/// Default log filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "drover_harness=info";

/// Install a fmt subscriber; `RUST_LOG` wins over `filter`
pub fn init_tracing(filter: Option<&str>) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| filter.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    // a subscriber may already be installed by the embedding program
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
