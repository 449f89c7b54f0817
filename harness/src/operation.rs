//! Supervision of long-running cluster operations
//!
//! An [`OperationPoller`] triggers an operation through an
//! [`OperationEndpoint`], waits for it to start after the pre-trigger
//! baseline and then polls until it reaches a terminal state. The poller
//! moves along a fixed path:
//!
//! ```text
//! Idle -> Triggering -> AwaitingStart -> Running -> Successful
//!                             |             |----> Failed
//!                             +-------------+----> TimedOut
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::PollingSettings;
use crate::error::{HarnessError, Result};
use crate::poll::{poll_until, retry_transient, PollSchedule};
use crate::report::{BoxedFiller, ReportRecord};

/// Remote state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationState {
    NotStarted,
    Running,
    Successful,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Successful | OperationState::Failed)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationState::NotStarted => write!(f, "not-started"),
            OperationState::Running => write!(f, "running"),
            OperationState::Successful => write!(f, "successful"),
            OperationState::Failed => write!(f, "failed"),
        }
    }
}

/// One status snapshot read from the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub state: OperationState,
    #[serde(default)]
    pub started_millis: Option<i64>,
    #[serde(default)]
    pub ended_millis: Option<i64>,
}

impl OperationStatus {
    pub fn new(state: OperationState) -> Self {
        Self {
            state,
            started_millis: None,
            ended_millis: None,
        }
    }

    pub fn started_at(mut self, millis: i64) -> Self {
        self.started_millis = Some(millis);
        self
    }

    pub fn ended_at(mut self, millis: i64) -> Self {
        self.ended_millis = Some(millis);
        self
    }

    /// End time, which only exists for terminal states
    pub fn ended(&self) -> Option<i64> {
        self.ended_millis.filter(|_| self.state.is_terminal())
    }

    /// True once the operation started after `baseline_millis`
    pub fn started_after(&self, baseline_millis: i64) -> bool {
        self.state != OperationState::NotStarted
            && self.started_millis.map_or(false, |started| started > baseline_millis)
    }
}

/// A cluster operation that can be triggered and observed
#[async_trait]
pub trait OperationEndpoint: Send + Sync {
    /// Descriptor used in logs and handles
    fn name(&self) -> String;

    /// Timestamp of the most recent trigger the cluster knows about
    async fn ready_millis(&self) -> Result<i64>;

    /// Ask the cluster to start the operation; rejection is a trigger error
    async fn trigger(&self) -> Result<()>;

    /// Current status, `None` while the cluster reports nothing yet
    async fn status(&self) -> Result<Option<OperationStatus>>;
}

/// Identifies one triggered operation
#[derive(Debug, Clone)]
pub struct OperationHandle {
    endpoint: String,
    triggered_at: DateTime<Utc>,
    baseline_millis: i64,
    deadline_origin: Instant,
}

impl OperationHandle {
    fn new(endpoint: String, baseline_millis: i64) -> Self {
        Self {
            endpoint,
            triggered_at: Utc::now(),
            baseline_millis,
            deadline_origin: Instant::now(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn triggered_at(&self) -> DateTime<Utc> {
        self.triggered_at
    }

    /// Start times at or before this belong to an earlier operation
    pub fn baseline_millis(&self) -> i64 {
        self.baseline_millis
    }

    pub fn elapsed(&self) -> Duration {
        self.deadline_origin.elapsed()
    }
}

/// Where the poller is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PollerState {
    Idle,
    Triggering,
    AwaitingStart,
    Running,
    Successful,
    Failed,
    TimedOut,
}

impl PollerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PollerState::Successful | PollerState::Failed | PollerState::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: PollerState) -> bool {
        use PollerState::*;
        matches!(
            (self, next),
            (Idle, Triggering)
                | (Triggering, AwaitingStart)
                | (AwaitingStart, Running)
                | (AwaitingStart, TimedOut)
                | (Running, Successful)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollerState::Idle => "idle",
            PollerState::Triggering => "triggering",
            PollerState::AwaitingStart => "awaiting-start",
            PollerState::Running => "running",
            PollerState::Successful => "successful",
            PollerState::Failed => "failed",
            PollerState::TimedOut => "timed-out",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful operation
#[derive(Debug, Clone)]
pub struct OperationReport {
    pub handle: OperationHandle,
    pub started_millis: i64,
    pub ended_millis: i64,
}

impl OperationReport {
    pub fn duration_millis(&self) -> i64 {
        self.ended_millis - self.started_millis
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_millis().max(0) as u64)
    }

    /// Time and throughput for `document_count` documents, tagged with `legend`
    pub fn result_filler(&self, document_count: u64, legend: &str) -> Result<BoxedFiller> {
        operation_result_filler(self.duration_millis(), document_count, legend)
    }
}

/// Filler with `reindexing.time.seconds`, `reindexing.throughput` and `legend`
pub fn operation_result_filler(
    time_millis: i64,
    document_count: u64,
    legend: &str,
) -> Result<BoxedFiller> {
    if time_millis == 0 {
        return Err(HarnessError::DivisionByZero {
            metric: "reindexing.throughput".to_string(),
        });
    }
    let seconds = time_millis as f64 * 1e-3;
    let throughput = document_count as f64 * 1e3 / time_millis as f64;
    let legend = legend.to_string();
    Ok(Box::new(move |record: &mut ReportRecord| {
        record.add_metric("reindexing.time.seconds", seconds);
        record.add_metric("reindexing.throughput", throughput);
        record.add_parameter("legend", legend.clone());
    }))
}

/// Drives one operation at a time through trigger, start and completion
pub struct OperationPoller {
    endpoint: Arc<dyn OperationEndpoint>,
    settings: PollingSettings,
    state: PollerState,
    history: Vec<PollerState>,
}

impl OperationPoller {
    pub fn new(endpoint: Arc<dyn OperationEndpoint>, settings: PollingSettings) -> Self {
        Self {
            endpoint,
            settings,
            state: PollerState::Idle,
            history: vec![PollerState::Idle],
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Every state visited since the last trigger, starting with `Idle`
    pub fn history(&self) -> &[PollerState] {
        &self.history
    }

    fn transition(&mut self, next: PollerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(HarnessError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("{}: {} -> {}", self.endpoint.name(), self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    fn schedule(&self, deadline: Duration) -> PollSchedule {
        PollSchedule::from_settings(&self.settings, deadline)
    }

    /// Trigger and wait for the operation to finish successfully
    pub async fn run(&mut self) -> Result<OperationReport> {
        let handle = self.trigger().await?;
        self.wait_for_terminal(&handle).await
    }

    /// Trigger the operation and return once it has started
    pub async fn trigger(&mut self) -> Result<OperationHandle> {
        self.state = PollerState::Idle;
        self.history = vec![PollerState::Idle];
        self.transition(PollerState::Triggering)?;

        let name = self.endpoint.name();
        let reads = self.schedule(self.settings.operation_timeout());

        let before = {
            let endpoint = self.endpoint.clone();
            retry_transient(&reads, || {
                let endpoint = endpoint.clone();
                async move { endpoint.ready_millis().await }
            })
            .await?
        };

        if let Err(e) = self.endpoint.trigger().await {
            error!("{}: trigger rejected: {}", name, e);
            return Err(match e {
                HarnessError::Trigger { .. } => e,
                other => HarnessError::trigger(other.to_string()),
            });
        }

        let after = {
            let endpoint = self.endpoint.clone();
            retry_transient(&reads, || {
                let endpoint = endpoint.clone();
                async move { endpoint.ready_millis().await }
            })
            .await?
        };

        if after <= before {
            let err = HarnessError::trigger(format!(
                "ready timestamp did not advance ({} -> {})",
                before, after
            ));
            error!("{}: {}", name, err);
            return Err(err);
        }

        let handle = OperationHandle::new(name.clone(), after);
        info!(
            "{}: trigger acknowledged, waiting for start after {} ms",
            name,
            handle.baseline_millis()
        );
        self.transition(PollerState::AwaitingStart)?;

        let baseline = handle.baseline_millis();
        let endpoint = self.endpoint.clone();
        let started = poll_until(&self.schedule(self.settings.start_timeout()), || {
            let endpoint = endpoint.clone();
            async move {
                let status = endpoint.status().await?;
                debug!("{}: awaiting start, status {:?}", endpoint.name(), status);
                Ok::<_, HarnessError>(status.filter(|s| s.started_after(baseline)))
            }
        })
        .await;

        match started {
            Ok(status) => {
                self.transition(PollerState::Running)?;
                info!(
                    "{}: operation started at {:?} ms after {:?}",
                    name,
                    status.started_millis,
                    handle.elapsed()
                );
                Ok(handle)
            }
            Err(e) => {
                let e = e.into_error(|elapsed| HarnessError::StartTimeout {
                    baseline_millis: baseline,
                    elapsed,
                });
                if matches!(e, HarnessError::StartTimeout { .. }) {
                    self.transition(PollerState::TimedOut)?;
                }
                error!("{}: {}", name, e);
                Err(e)
            }
        }
    }

    /// Poll until the triggered operation reaches a terminal state
    pub async fn wait_for_terminal(&mut self, handle: &OperationHandle) -> Result<OperationReport> {
        if self.state != PollerState::Running {
            return Err(HarnessError::InvalidTransition {
                from: self.state.to_string(),
                to: PollerState::Running.to_string(),
            });
        }

        let name = handle.endpoint().to_string();
        let baseline = handle.baseline_millis();
        let budget = self.settings.operation_timeout();
        let remaining = budget.saturating_sub(handle.elapsed());

        let endpoint = self.endpoint.clone();
        let terminal = poll_until(&self.schedule(remaining), || {
            let endpoint = endpoint.clone();
            async move {
                let status = endpoint.status().await?;
                debug!("{}: running, status {:?}", endpoint.name(), status);
                Ok::<_, HarnessError>(
                    status.filter(|s| s.state.is_terminal() && s.started_after(baseline)),
                )
            }
        })
        .await;

        let status = match terminal {
            Ok(status) => status,
            Err(e) => {
                let e = e.into_error(|_| HarnessError::OperationTimeout {
                    elapsed: handle.elapsed(),
                });
                if matches!(e, HarnessError::OperationTimeout { .. }) {
                    self.transition(PollerState::TimedOut)?;
                }
                error!("{}: {}", name, e);
                return Err(e);
            }
        };

        let started_millis = status.started_millis.unwrap_or(baseline);
        let Some(ended_millis) = status.ended() else {
            self.transition(PollerState::Failed)?;
            let err = HarnessError::protocol(format!("{} state without endedMillis", status.state));
            error!("{}: {}", name, err);
            return Err(err);
        };

        match status.state {
            OperationState::Successful => {
                self.transition(PollerState::Successful)?;
                let report = OperationReport {
                    handle: handle.clone(),
                    started_millis,
                    ended_millis,
                };
                info!(
                    "{}: operation successful in {} ms",
                    name,
                    report.duration_millis()
                );
                Ok(report)
            }
            _ => {
                self.transition(PollerState::Failed)?;
                let err = HarnessError::OperationFailed {
                    started_millis,
                    ended_millis,
                    elapsed: handle.elapsed(),
                };
                error!("{}: {}", name, err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportFiller;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Script {
        ready: Mutex<VecDeque<i64>>,
        statuses: Mutex<VecDeque<Option<OperationStatus>>>,
        last: Mutex<Option<OperationStatus>>,
    }

    impl Script {
        fn new(ready: &[i64], statuses: Vec<Option<OperationStatus>>) -> Arc<Self> {
            Arc::new(Self {
                ready: Mutex::new(ready.iter().copied().collect()),
                statuses: Mutex::new(statuses.into()),
                last: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl OperationEndpoint for Script {
        fn name(&self) -> String {
            "script".to_string()
        }

        async fn ready_millis(&self) -> Result<i64> {
            let mut ready = self.ready.lock().unwrap();
            Ok(if ready.len() > 1 {
                ready.pop_front().unwrap()
            } else {
                *ready.front().unwrap()
            })
        }

        async fn trigger(&self) -> Result<()> {
            Ok(())
        }

        async fn status(&self) -> Result<Option<OperationStatus>> {
            let next = self.statuses.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            if let Some(status) = next {
                *last = status;
            }
            Ok(*last)
        }
    }

    fn settings() -> PollingSettings {
        PollingSettings {
            start_timeout_secs: 10,
            operation_timeout_secs: 60,
            ..Default::default()
        }
    }

    #[test]
    fn test_state_serialization() {
        let status: OperationStatus = serde_json::from_value(serde_json::json!({
            "state": "not-started"
        }))
        .unwrap();
        assert_eq!(status.state, OperationState::NotStarted);

        let status: OperationStatus = serde_json::from_value(serde_json::json!({
            "state": "successful", "startedMillis": 150, "endedMillis": 5150
        }))
        .unwrap();
        assert_eq!(status.ended(), Some(5150));
    }

    #[test]
    fn test_ended_only_for_terminal_states() {
        let running = OperationStatus::new(OperationState::Running)
            .started_at(1)
            .ended_at(2);
        assert_eq!(running.ended(), None);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        use PollerState::*;
        let all = [Idle, Triggering, AwaitingStart, Running, Successful, Failed, TimedOut];
        for from in [Successful, Failed, TimedOut] {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
        assert!(!Idle.can_transition_to(Running));
        assert!(!AwaitingStart.can_transition_to(Successful));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_completes() {
        let script = Script::new(
            &[100, 120],
            vec![
                Some(OperationStatus::new(OperationState::NotStarted)),
                Some(OperationStatus::new(OperationState::Running).started_at(150)),
                Some(
                    OperationStatus::new(OperationState::Successful)
                        .started_at(150)
                        .ended_at(5150),
                ),
            ],
        );
        let mut poller = OperationPoller::new(script, settings());
        let report = poller.run().await.unwrap();

        assert_eq!(report.duration_millis(), 5000);
        assert_eq!(report.handle.baseline_millis(), 120);
        assert_eq!(
            poller.history(),
            &[
                PollerState::Idle,
                PollerState::Triggering,
                PollerState::AwaitingStart,
                PollerState::Running,
                PollerState::Successful
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_start_times_out() {
        let stale = OperationStatus::new(OperationState::Successful)
            .started_at(50)
            .ended_at(90);
        let script = Script::new(&[100, 101], vec![Some(stale)]);
        let mut poller = OperationPoller::new(script, settings());

        let err = poller.run().await.unwrap_err();
        assert!(matches!(err, HarnessError::StartTimeout { baseline_millis: 101, .. }));
        assert_eq!(poller.state(), PollerState::TimedOut);
        assert!(!poller.history().contains(&PollerState::Successful));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unadvanced_ready_timestamp_fails_trigger() {
        for ready in [&[100][..], &[100, 90][..]] {
            let script = Script::new(ready, vec![None]);
            let mut poller = OperationPoller::new(script, PollingSettings::default());
            assert!(matches!(
                poller.trigger().await,
                Err(HarnessError::Trigger { .. })
            ));
            assert!(!poller.history().contains(&PollerState::AwaitingStart));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_status_without_end_fails_poller() {
        let script = Script::new(
            &[100, 120],
            vec![
                Some(OperationStatus::new(OperationState::Running).started_at(150)),
                Some(OperationStatus::new(OperationState::Successful).started_at(150)),
            ],
        );
        let mut poller = OperationPoller::new(script, settings());
        let handle = poller.trigger().await.unwrap();

        let err = poller.wait_for_terminal(&handle).await.unwrap_err();
        assert!(matches!(err, HarnessError::Protocol { .. }));
        assert_eq!(poller.state(), PollerState::Failed);
        assert_eq!(poller.history().last(), Some(&PollerState::Failed));

        let again = poller.wait_for_terminal(&handle).await.unwrap_err();
        assert!(matches!(again, HarnessError::InvalidTransition { .. }));
    }

    #[test]
    fn test_result_filler() {
        let filler = operation_result_filler(50_000, 1_000_000, "reindex").unwrap();
        let mut record = ReportRecord::new();
        filler.apply(&mut record);
        assert_eq!(record.metric_f64("reindexing.time.seconds"), Some(50.0));
        assert_eq!(record.metric_f64("reindexing.throughput"), Some(20_000.0));
        assert!(matches!(
            operation_result_filler(0, 10, "reindex"),
            Err(HarnessError::DivisionByZero { .. })
        ));
    }
}
