//! Per-scenario state handed to every component of a test scenario

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::error::Result;
use crate::operation::{OperationEndpoint, OperationPoller};
use crate::process::ExternalProcessRunner;
use crate::remote::RemoteExecutor;
use crate::report::{BoundViolation, BoxedFiller, GraphSpec, MetricsReport};
use crate::sampler::{RemoteSampler, ResourceSampler, SystemSampler};
use crate::session::BenchmarkSession;

/// Created at scenario start and dropped at scenario end, which removes
/// the scratch directory
pub struct ScenarioContext {
    name: String,
    config: HarnessConfig,
    executor: Arc<dyn RemoteExecutor>,
    scratch: TempDir,
    graphs: Vec<GraphSpec>,
    reports: Vec<MetricsReport>,
}

impl ScenarioContext {
    pub fn new(
        name: impl Into<String>,
        config: HarnessConfig,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Result<Self> {
        let name = name.into();
        let scratch = tempfile::Builder::new()
            .prefix(&format!("drover-{}-", name))
            .tempdir()?;
        debug!("Scenario {} scratch directory {}", name, scratch.path().display());

        Ok(Self {
            name,
            config,
            executor,
            scratch,
            graphs: Vec::new(),
            reports: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn executor(&self) -> Arc<dyn RemoteExecutor> {
        self.executor.clone()
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Distinct stdout/stderr files for the benchmark called `label`
    pub fn output_paths(&self, label: &str) -> (PathBuf, PathBuf) {
        (
            self.scratch.path().join(format!("{}.out", label)),
            self.scratch.path().join(format!("{}.err", label)),
        )
    }

    /// Graphs attached to every report written from now on
    pub fn set_graphs(&mut self, graphs: Vec<GraphSpec>) {
        self.graphs = graphs;
    }

    pub fn runner(&self) -> ExternalProcessRunner {
        ExternalProcessRunner::new(self.executor.clone(), self.config.process.pool_size)
    }

    pub fn system_sampler(&self) -> Arc<dyn ResourceSampler> {
        Arc::new(SystemSampler::new(self.config.sampling.interval()))
    }

    /// Sampler reading `/proc` of the benchmark host through the executor
    pub fn remote_sampler(&self) -> Arc<dyn ResourceSampler> {
        Arc::new(RemoteSampler::new(
            self.executor.clone(),
            self.config.sampling.interval(),
        ))
    }

    /// A benchmark session on `host` writing its output into the scratch directory
    pub fn session(&self, host: &str, sampler: Arc<dyn ResourceSampler>) -> BenchmarkSession {
        BenchmarkSession::new(host, self.runner(), sampler)
            .with_output_dir(self.scratch.path())
            .with_wait_timeout(self.config.process.wait_timeout())
    }

    pub fn poller(&self, endpoint: Arc<dyn OperationEndpoint>) -> OperationPoller {
        OperationPoller::new(endpoint, self.config.polling.clone())
    }

    /// Build a report from `fillers` and keep it with the scenario
    pub fn write_report(&mut self, fillers: Vec<BoxedFiller>) -> &MetricsReport {
        let report = MetricsReport::from_fillers(&fillers, self.graphs.clone());
        info!(
            "{}: report {}",
            self.name,
            serde_json::to_string(&report.render()).unwrap_or_default()
        );
        let index = self.reports.len();
        self.reports.push(report);
        &self.reports[index]
    }

    pub fn reports(&self) -> &[MetricsReport] {
        &self.reports
    }

    /// Bound violations across every report of the scenario
    pub fn violations(&self) -> Vec<BoundViolation> {
        self.reports.iter().flat_map(MetricsReport::violations).collect()
    }

    /// Append every report as one JSON line to `path`
    pub fn flush(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        for report in &self.reports {
            serde_json::to_writer(&mut file, &report.render())?;
            file.write_all(b"\n")?;
        }
        info!("{}: wrote {} reports to {}", self.name, self.reports.len(), path.display());
        Ok(self.reports.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::LocalExecutor;
    use crate::report::{metric_filler, parameter_filler, Bounds};

    fn context() -> ScenarioContext {
        ScenarioContext::new("unit", HarnessConfig::default(), Arc::new(LocalExecutor::new())).unwrap()
    }

    #[test]
    fn test_scratch_removed_on_drop() {
        let ctx = context();
        let scratch = ctx.scratch_dir().to_path_buf();
        assert!(scratch.exists());
        let (out, err) = ctx.output_paths("vespa-cli-feed-10b");
        assert!(out.ends_with("vespa-cli-feed-10b.out"));
        assert!(err.ends_with("vespa-cli-feed-10b.err"));
        drop(ctx);
        assert!(!scratch.exists());
    }

    #[test]
    fn test_reports_flushed_as_json_lines() {
        let mut ctx = context();
        ctx.set_graphs(vec![GraphSpec::new("qps", "clients", "qps").with_bounds(Bounds::new(0.0, 10.0))]);
        ctx.write_report(vec![parameter_filler("clients", 1u32), metric_filler("qps", 5.0)]);
        ctx.write_report(vec![parameter_filler("clients", 2u32), metric_filler("qps", 50.0)]);
        assert_eq!(ctx.violations().len(), 1);

        let path = ctx.scratch_dir().join("out/reports.jsonl");
        assert_eq!(ctx.flush(&path).unwrap(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["metrics"]["qps"], serde_json::json!(50.0));
    }
}
