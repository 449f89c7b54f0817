//! One benchmark invocation: sample, launch, wait, parse, report
//!
//! [`BenchmarkSession::run`] brackets the external process with resource
//! sampling, turns the captured stdout into derived metrics and applies all
//! fillers to a fresh [`ReportRecord`]. Sampling is stopped on every path
//! once it has been started.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::{HarnessError, Phase, Result};
use crate::process::{ExternalProcessRunner, ProcessOutcome};
use crate::remote::ShellCommand;
use crate::report::{json_to_filler, parameter_filler, BoxedFiller, ReportRecord};
use crate::sampler::ResourceSampler;

pub const DEFAULT_ROUTE: &str = "null/default";

/// How a benchmark writes its result to stdout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// A single JSON object
    #[default]
    Json,
    /// One `key=value` pair per line
    KeyValue,
    /// JSON when the output starts with `{`, key/value otherwise
    Auto,
}

/// Parse benchmark stdout into a flat object
pub fn parse_output(stdout: &str, format: OutputFormat) -> Result<Map<String, Value>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(HarnessError::parse("benchmark produced no output"));
    }

    match format {
        OutputFormat::Json => parse_json(trimmed),
        OutputFormat::KeyValue => parse_key_values(trimmed),
        OutputFormat::Auto if trimmed.starts_with('{') => parse_json(trimmed),
        OutputFormat::Auto => parse_key_values(trimmed),
    }
}

fn parse_json(text: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(HarnessError::parse(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(HarnessError::parse(format!("invalid JSON output: {}", e))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn parse_key_values(text: &str) -> Result<Map<String, Value>> {
    let mut object = Map::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, raw) = line.split_once('=').ok_or_else(|| {
            HarnessError::parse(format!("line {}: expected key=value, got {:?}", number + 1, line))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(HarnessError::parse(format!("line {}: empty key", number + 1)));
        }
        object.insert(key.to_string(), scalar(raw.trim()));
    }
    Ok(object)
}

fn scalar(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Some(n) = raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        return Value::Number(n);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

/// Feed client counters as reported on stdout
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeederSummary {
    pub seconds: f64,
    pub ok_count: f64,
    pub error_count: f64,
    pub exception_count: Option<f64>,
    pub request_bytes: Option<f64>,
    pub response_bytes: Option<f64>,
    pub latency_min_ms: Option<f64>,
    pub latency_avg_ms: Option<f64>,
    pub latency_max_ms: Option<f64>,
}

impl FeederSummary {
    pub fn from_output(output: &Map<String, Value>) -> Result<Self> {
        let required = |key: &str| -> Result<f64> {
            match output.get(key) {
                Some(value) => number(key, value),
                None => Err(HarnessError::parse(format!("missing field {}", key))),
            }
        };
        let optional = |key: &str| -> Result<Option<f64>> {
            output.get(key).map(|value| number(key, value)).transpose()
        };

        Ok(Self {
            seconds: required("feeder.seconds")?,
            ok_count: required("feeder.ok.count")?,
            error_count: required("feeder.error.count")?,
            exception_count: optional("http.exception.count")?,
            request_bytes: optional("http.request.bytes")?,
            response_bytes: optional("http.response.bytes")?,
            latency_min_ms: optional("http.response.latency.millis.min")?,
            latency_avg_ms: optional("http.response.latency.millis.avg")?,
            latency_max_ms: optional("http.response.latency.millis.max")?,
        })
    }

    /// Reported metric set; throughput is documents per second
    pub fn derive_metrics(&self) -> Result<Map<String, Value>> {
        let duration_millis = self.seconds * 1000.0;
        if duration_millis == 0.0 {
            return Err(HarnessError::DivisionByZero {
                metric: "feeder.throughput".to_string(),
            });
        }
        let throughput = self.ok_count / duration_millis * 1000.0;

        let mut metrics = Map::new();
        let mut put = |key: &str, value: f64| {
            metrics.insert(key.to_string(), Value::from(value));
        };
        put("feeder.runtime", duration_millis);
        put("feeder.okcount", self.ok_count);
        put("feeder.errorcount", self.error_count);
        put("feeder.throughput", throughput);

        let optional = [
            ("feeder.exceptions", self.exception_count),
            ("feeder.bytessent", self.request_bytes),
            ("feeder.bytesreceived", self.response_bytes),
            ("feeder.minlatency", self.latency_min_ms),
            ("feeder.avglatency", self.latency_avg_ms),
            ("feeder.maxlatency", self.latency_max_ms),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                put(key, value);
            }
        }
        Ok(metrics)
    }
}

fn number(key: &str, value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| HarnessError::parse(format!("{} is out of range", key))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| HarnessError::parse(format!("{} is not numeric: {:?}", key, s))),
        other => Err(HarnessError::parse(format!(
            "{} is not numeric: {}",
            key,
            json_kind(other)
        ))),
    }
}

/// Describes the benchmark program a session runs
pub trait CommandBuilder: Send + Sync {
    /// Run label; also names the output files
    fn label(&self) -> String;

    fn build(&self) -> ShellCommand;

    /// Parameter fillers describing this run
    fn parameters(&self) -> Vec<BoxedFiller> {
        vec![parameter_filler("label", self.label())]
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    /// Turn parsed stdout into the reported metrics
    fn derive(&self, output: &Map<String, Value>) -> Result<Map<String, Value>> {
        FeederSummary::from_output(output)?.derive_metrics()
    }
}

/// A `vespa feed` style feed client invocation
#[derive(Debug, Clone, PartialEq)]
pub struct FeedCommand {
    pub program: String,
    pub target: String,
    pub feed_file: String,
    pub connections: u32,
    pub route: String,
    pub document_size: usize,
    pub env: Vec<(String, String)>,
}

impl FeedCommand {
    pub fn new(target: impl Into<String>, feed_file: impl Into<String>) -> Self {
        Self {
            program: "vespa".to_string(),
            target: target.into(),
            feed_file: feed_file.into(),
            connections: 32,
            route: DEFAULT_ROUTE.to_string(),
            document_size: 0,
            env: Vec::new(),
        }
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn connections(mut self, connections: u32) -> Self {
        self.connections = connections;
        self
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn document_size(mut self, bytes: usize) -> Self {
        self.document_size = bytes;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl CommandBuilder for FeedCommand {
    fn label(&self) -> String {
        format!("{}-cli-feed-{}b", self.program, self.document_size)
    }

    fn build(&self) -> ShellCommand {
        let mut command = ShellCommand::new(&self.program)
            .arg("feed")
            .arg(format!("--target={}", self.target))
            .arg(format!("--connections={}", self.connections))
            .arg(format!("--route={}", self.route))
            .arg(&self.feed_file);
        command.env = self.env.clone();
        command
    }

    fn parameters(&self) -> Vec<BoxedFiller> {
        vec![
            parameter_filler("size", self.document_size),
            parameter_filler("label", self.label()),
            parameter_filler("clients", self.connections),
        ]
    }
}

/// Runs benchmark commands on one host with resource sampling
pub struct BenchmarkSession {
    host: String,
    runner: ExternalProcessRunner,
    sampler: Arc<dyn ResourceSampler>,
    output_dir: PathBuf,
    wait_timeout: Duration,
}

impl BenchmarkSession {
    pub fn new(
        host: impl Into<String>,
        runner: ExternalProcessRunner,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        Self {
            host: host.into(),
            runner,
            sampler,
            output_dir: PathBuf::from("."),
            wait_timeout: Duration::from_secs(7200),
        }
    }

    /// Directory on the target host receiving `<label>.out` and `<label>.err`
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn output_paths(&self, label: &str) -> (String, String) {
        (
            self.output_dir.join(format!("{}.out", label)).display().to_string(),
            self.output_dir.join(format!("{}.err", label)).display().to_string(),
        )
    }

    /// Run one benchmark and build its record from derived metrics,
    /// the builder's parameters, `fillers` and the sampler, in that order
    pub async fn run(
        &self,
        builder: &dyn CommandBuilder,
        fillers: Vec<BoxedFiller>,
    ) -> Result<ReportRecord> {
        let label = builder.label();
        info!("Starting benchmark {} on {}", label, self.host);

        let result = match self.sampler.start(&self.host).await {
            Ok(()) => self.execute(builder, &label).await,
            Err(e) => Err(e),
        };
        let stopped = self.sampler.stop().await;

        let metrics = match (result, stopped) {
            (Ok(metrics), Ok(())) => metrics,
            (Err(e), stopped) => {
                if let Err(stop_err) = stopped {
                    warn!("Stopping sampler after failure: {}", stop_err);
                }
                error!("Benchmark {} failed: {}", label, e);
                return Err(e);
            }
            (Ok(_), Err(e)) => {
                error!("Benchmark {} failed: {}", label, e);
                return Err(e);
            }
        };

        let mut record = ReportRecord::new();
        record.apply(json_to_filler(&metrics).as_ref());
        for filler in builder.parameters().iter().chain(fillers.iter()) {
            record.apply(filler.as_ref());
        }
        record.apply(self.sampler.filler().as_ref());

        info!(
            "Benchmark {} done: {} metrics, {} parameters",
            label,
            record.metrics.len(),
            record.parameters.len()
        );
        Ok(record)
    }

    async fn execute(&self, builder: &dyn CommandBuilder, label: &str) -> Result<Map<String, Value>> {
        let command = builder.build();
        let (stdout_path, stderr_path) = self.output_paths(label);

        let mut handle = self
            .runner
            .launch(&self.host, &command, &stdout_path, &stderr_path)
            .await?;
        let outcome = self.runner.wait_for(&mut handle, self.wait_timeout).await?;

        match self.runner.read_stderr(&handle).await {
            Ok(stderr) if !stderr.trim().is_empty() => info!("{} stderr:\n{}", label, stderr.trim_end()),
            Ok(_) => {}
            Err(e) => warn!("Could not read {}: {}", stderr_path, e),
        }
        let stdout = self.runner.read_stdout(&handle).await;
        if let Ok(stdout) = &stdout {
            debug!("{} stdout:\n{}", label, stdout.trim_end());
        }

        match outcome {
            ProcessOutcome::TimedOut { elapsed } => {
                // the process and its files stay behind for inspection
                return Err(HarnessError::Timeout {
                    phase: Phase::Run,
                    elapsed,
                });
            }
            ProcessOutcome::Completed { exit_code, .. } => match abnormal_exit(exit_code) {
                Some(note) => warn!("{} {}", label, note),
                None if exit_code.is_none() => debug!("{} finished, exit status unknown", label),
                None => {}
            },
        }

        let stdout = stdout?;
        if let Err(e) = self.runner.reap(handle).await {
            warn!("Leaving output files of {} behind: {}", label, e);
        }

        let parsed = parse_output(&stdout, builder.output_format())?;
        builder.derive(&parsed)
    }
}

/// Warning for a known non-zero exit; an unknown status is not abnormal
fn abnormal_exit(exit_code: Option<i32>) -> Option<String> {
    match exit_code {
        Some(0) | None => None,
        Some(code) => Some(format!("exited with status {}", code)),
    }
}
