use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use drover_harness::{BoxedFiller, HarnessError, ReportRecord, ResourceSampler, Result};

use super::EventLog;

/// Sampler that counts its start/stop calls and reports a fixed CPU figure
#[derive(Default)]
pub struct CountingSampler {
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_start: bool,
    log: EventLog,
}

impl CountingSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sampler whose start fails
    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceSampler for CountingSampler {
    async fn start(&self, host: &str) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("sampler-start {}", host));
        if self.fail_start {
            return Err(HarnessError::Sampler(format!("cannot sample {}", host)));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.log.push("sampler-stop");
        Ok(())
    }

    fn filler(&self) -> BoxedFiller {
        Box::new(|record: &mut ReportRecord| {
            record.add_metric("cpuutil", 42.0);
        })
    }
}
