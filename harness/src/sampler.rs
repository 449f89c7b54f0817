//! CPU and memory sampling alongside a benchmark run

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::remote::RemoteExecutor;
use crate::report::{BoxedFiller, ReportRecord};

/// Samples host resources while a benchmark runs
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn start(&self, host: &str) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Filler carrying what was sampled so far
    fn filler(&self) -> BoxedFiller;
}

/// Aggregated samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub samples: u32,
    pub cpu_sum: f64,
    pub cpu_max: f64,
    pub memory_sum_mb: f64,
    pub memory_max_mb: f64,
}

impl SampleSummary {
    pub fn record(&mut self, cpu_percent: f64, memory_mb: f64) {
        self.samples += 1;
        self.cpu_sum += cpu_percent;
        self.cpu_max = self.cpu_max.max(cpu_percent);
        self.memory_sum_mb += memory_mb;
        self.memory_max_mb = self.memory_max_mb.max(memory_mb);
    }

    pub fn cpu_mean(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.cpu_sum / self.samples as f64)
    }

    pub fn memory_mean_mb(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.memory_sum_mb / self.samples as f64)
    }

    pub fn fill(&self, record: &mut ReportRecord) {
        if let (Some(cpu), Some(memory)) = (self.cpu_mean(), self.memory_mean_mb()) {
            record.add_metric("cpuutil", cpu);
            record.add_metric("cpuutil.max", self.cpu_max);
            record.add_metric("memory.used.mb", memory);
            record.add_metric("memory.used.mb.max", self.memory_max_mb);
        }
    }
}

struct SamplingTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type SharedSummary = Arc<std::sync::Mutex<SampleSummary>>;

fn record_sample(summary: &SharedSummary, cpu_percent: f64, memory_mb: f64) {
    summary
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .record(cpu_percent, memory_mb);
}

/// Start/stop bookkeeping shared by the background samplers
struct SamplingLoop {
    interval: Duration,
    running: AtomicBool,
    summary: SharedSummary,
    task: Mutex<Option<SamplingTask>>,
}

impl SamplingLoop {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: AtomicBool::new(false),
            summary: Arc::new(std::sync::Mutex::new(SampleSummary::default())),
            task: Mutex::new(None),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn summary(&self) -> SampleSummary {
        *self.summary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn start<F, Fut>(&self, host: &str, sample: F) -> Result<()>
    where
        F: FnOnce(CancellationToken, SharedSummary) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(HarnessError::Sampler("sampler already running".to_string()));
        }

        *self.summary.lock().unwrap_or_else(PoisonError::into_inner) = SampleSummary::default();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sample(cancel.clone(), self.summary.clone()));

        *self.task.lock().await = Some(SamplingTask { cancel, handle });
        info!("Resource sampling started for {} every {:?}", host, self.interval);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(task) = self.task.lock().await.take() else {
            debug!("Resource sampler was not running");
            return Ok(());
        };

        task.cancel.cancel();
        let joined = task.handle.await;
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = joined {
            warn!("Sampling task ended abnormally: {}", e);
            return Err(HarnessError::Sampler(e.to_string()));
        }

        let summary = self.summary();
        info!(
            "Resource sampling stopped after {} samples (mean cpu {:?}%)",
            summary.samples,
            summary.cpu_mean()
        );
        Ok(())
    }

    fn filler(&self) -> BoxedFiller {
        let summary = self.summary();
        Box::new(move |record: &mut ReportRecord| summary.fill(record))
    }
}

/// Samples the machine the harness runs on with `sysinfo`
pub struct SystemSampler {
    sampling: SamplingLoop,
}

impl SystemSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            sampling: SamplingLoop::new(interval),
        }
    }

    pub fn is_running(&self) -> bool {
        self.sampling.is_running()
    }

    pub fn summary(&self) -> SampleSummary {
        self.sampling.summary()
    }
}

#[async_trait]
impl ResourceSampler for SystemSampler {
    async fn start(&self, host: &str) -> Result<()> {
        let interval = self.sampling.interval;
        self.sampling
            .start(host, move |token, summary| async move {
                let mut system = sysinfo::System::new();
                // first cpu reading only establishes a baseline
                system.refresh_cpu();

                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }

                    system.refresh_cpu();
                    system.refresh_memory();
                    let cpu = system.global_cpu_info().cpu_usage() as f64;
                    let memory_mb = system.used_memory() as f64 / 1024.0 / 1024.0;
                    record_sample(&summary, cpu, memory_mb);
                }
            })
            .await
    }

    async fn stop(&self) -> Result<()> {
        self.sampling.stop().await
    }

    fn filler(&self) -> BoxedFiller {
        self.sampling.filler()
    }
}

const PROC_READ: &str = "cat /proc/stat /proc/meminfo";

/// Aggregate jiffies from the `cpu` line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub total: u64,
    /// idle plus iowait
    pub idle: u64,
}

impl CpuTimes {
    pub fn parse(proc_stat: &str) -> Option<Self> {
        let line = proc_stat.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .map(str::parse)
            .collect::<std::result::Result<_, _>>()
            .ok()?;
        if fields.len() < 4 {
            return None;
        }
        Some(Self {
            total: fields.iter().sum(),
            idle: fields[3] + fields.get(4).copied().unwrap_or(0),
        })
    }

    /// Busy percentage between `earlier` and this reading
    pub fn utilisation_since(&self, earlier: &CpuTimes) -> Option<f64> {
        let total = self.total.checked_sub(earlier.total)?;
        let idle = self.idle.checked_sub(earlier.idle)?;
        if total == 0 {
            return None;
        }
        Some(100.0 * total.saturating_sub(idle) as f64 / total as f64)
    }
}

/// Used memory in MB from `/proc/meminfo`
pub fn parse_memory_used_mb(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find_map(|l| l.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|kb| kb.parse().ok())
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    Some(total.saturating_sub(available) as f64 / 1024.0)
}

async fn read_proc(executor: &dyn RemoteExecutor, host: &str) -> Result<(CpuTimes, f64)> {
    let output = executor.execute(host, PROC_READ).await?;
    if !output.success() {
        return Err(HarnessError::Sampler(format!(
            "{} failed on {}: {}",
            PROC_READ,
            host,
            output.stderr.trim()
        )));
    }
    let cpu = CpuTimes::parse(&output.stdout)
        .ok_or_else(|| HarnessError::Sampler(format!("no cpu line in /proc/stat of {}", host)))?;
    let memory_mb = parse_memory_used_mb(&output.stdout)
        .ok_or_else(|| HarnessError::Sampler(format!("no memory totals in /proc/meminfo of {}", host)))?;
    Ok((cpu, memory_mb))
}

/// Samples a Linux host through its executor by reading `/proc`
pub struct RemoteSampler {
    executor: Arc<dyn RemoteExecutor>,
    sampling: SamplingLoop,
}

impl RemoteSampler {
    pub fn new(executor: Arc<dyn RemoteExecutor>, interval: Duration) -> Self {
        Self {
            executor,
            sampling: SamplingLoop::new(interval),
        }
    }

    pub fn is_running(&self) -> bool {
        self.sampling.is_running()
    }

    pub fn summary(&self) -> SampleSummary {
        self.sampling.summary()
    }
}

#[async_trait]
impl ResourceSampler for RemoteSampler {
    async fn start(&self, host: &str) -> Result<()> {
        let interval = self.sampling.interval;
        let executor = self.executor.clone();
        let host_name = host.to_string();
        self.sampling
            .start(host, move |token, summary| async move {
                let mut previous: Option<CpuTimes> = None;
                loop {
                    match read_proc(executor.as_ref(), &host_name).await {
                        Ok((cpu, memory_mb)) => {
                            if let Some(util) = previous.and_then(|p| cpu.utilisation_since(&p)) {
                                record_sample(&summary, util, memory_mb);
                            }
                            previous = Some(cpu);
                        }
                        Err(e) => warn!("Skipping resource sample: {}", e),
                    }

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            })
            .await
    }

    async fn stop(&self) -> Result<()> {
        self.sampling.stop().await
    }

    fn filler(&self) -> BoxedFiller {
        self.sampling.filler()
    }
}

/// Sampler that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSampler;

#[async_trait]
impl ResourceSampler for NoopSampler {
    async fn start(&self, _host: &str) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn filler(&self) -> BoxedFiller {
        Box::new(|_: &mut ReportRecord| {})
    }
}
