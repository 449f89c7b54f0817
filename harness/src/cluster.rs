//! HTTP collaborators for the cluster's application API

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::error::{HarnessError, Phase, Result};
use crate::operation::{OperationEndpoint, OperationStatus};
use crate::poll::{poll_until, PollSchedule};

/// Thin JSON client for an application's REST surface
#[derive(Clone)]
pub struct ApplicationClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl ApplicationClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            client,
            base_url,
            timeout: Duration::from_secs(30),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn request_with_timeout<T>(
        &self,
        future: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        timeout(self.timeout, future)
            .await
            .map_err(|_| HarnessError::transient(format!("no answer from {} within {:?}", self.base_url, self.timeout)))?
    }

    /// GET `path` and decode the JSON body
    pub async fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        self.request_with_timeout(async {
            let response = self.client.get(&url).send().await.map_err(transport_error)?;
            self.handle_response(&url, response).await
        })
        .await
    }

    /// POST an empty body, returning status and body text
    pub async fn post(&self, path: &str) -> Result<(StatusCode, String)> {
        let url = self.url(path);
        self.request_with_timeout(async {
            let response = self.client.post(&url).send().await.map_err(transport_error)?;
            let status = response.status();
            let text = response.text().await.map_err(transport_error)?;
            Ok((status, text))
        })
        .await
    }

    async fn handle_response(&self, url: &str, response: Response) -> Result<Value> {
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if status.is_server_error() {
            return Err(HarnessError::transient(format!("{} answered HTTP {}", url, status)));
        }
        if !status.is_success() {
            return Err(HarnessError::protocol(format!(
                "{} answered HTTP {}: {}",
                url,
                status,
                text.trim()
            )));
        }

        serde_json::from_str(&text)
            .map_err(|e| HarnessError::protocol(format!("invalid JSON from {}: {}", url, e)))
    }

    pub async fn ping(&self) -> Result<()> {
        self.get_json("").await.map(|_| ())
    }
}

/// Connection trouble may clear up; anything else is a protocol problem
fn transport_error(err: reqwest::Error) -> HarnessError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        HarnessError::transient(err.to_string())
    } else {
        HarnessError::Http(err)
    }
}

/// `status.readyMillis` from a reindexing document; absent means never triggered
pub fn parse_ready_millis(document: &Value) -> Result<i64> {
    let status = document
        .get("status")
        .and_then(Value::as_object)
        .ok_or_else(|| HarnessError::protocol("reindexing response has no status object"))?;
    match status.get("readyMillis") {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value
            .as_i64()
            .ok_or_else(|| HarnessError::protocol(format!("readyMillis is not an integer: {}", value))),
    }
}

/// First entry of the `status` object that carries a `state`
pub fn parse_operation_status(document: &Value) -> Result<Option<OperationStatus>> {
    let status = document
        .get("status")
        .and_then(Value::as_object)
        .ok_or_else(|| HarnessError::protocol("reindexing response has no status object"))?;

    let entry = status
        .values()
        .find(|entry| entry.get("state").is_some());
    match entry {
        Some(entry) => serde_json::from_value(entry.clone())
            .map(Some)
            .map_err(|e| HarnessError::protocol(format!("unreadable operation status: {}", e))),
        None => Ok(None),
    }
}

/// Reindexing of an application, driven through its REST API
#[derive(Clone)]
pub struct ReindexingEndpoint {
    client: ApplicationClient,
    status_path: String,
    trigger_path: String,
}

impl ReindexingEndpoint {
    pub fn new(client: ApplicationClient) -> Self {
        Self {
            client,
            status_path: "reindexing".to_string(),
            trigger_path: "reindex".to_string(),
        }
    }

    pub fn with_paths(mut self, status_path: impl Into<String>, trigger_path: impl Into<String>) -> Self {
        self.status_path = status_path.into();
        self.trigger_path = trigger_path.into();
        self
    }
}

#[async_trait]
impl OperationEndpoint for ReindexingEndpoint {
    fn name(&self) -> String {
        self.client.url(&self.status_path)
    }

    async fn ready_millis(&self) -> Result<i64> {
        let document = self.client.get_json(&self.status_path).await?;
        parse_ready_millis(&document)
    }

    async fn trigger(&self) -> Result<()> {
        let (status, body) = self
            .client
            .post(&self.trigger_path)
            .await
            .map_err(|e| HarnessError::trigger(e.to_string()))?;
        if status != StatusCode::OK {
            return Err(HarnessError::trigger(format!(
                "{} answered HTTP {}: {}",
                self.client.url(&self.trigger_path),
                status,
                body.trim()
            )));
        }
        debug!("Reindex accepted: {}", body.trim());
        Ok(())
    }

    async fn status(&self) -> Result<Option<OperationStatus>> {
        let document = self.client.get_json(&self.status_path).await?;
        parse_operation_status(&document)
    }
}

/// Service convergence on a config generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Convergence {
    pub converged: bool,
    #[serde(default)]
    pub wanted_generation: i64,
}

#[async_trait]
pub trait ConvergenceSource: Send + Sync {
    async fn convergence(&self) -> Result<Convergence>;
}

#[async_trait]
impl ConvergenceSource for ApplicationClient {
    async fn convergence(&self) -> Result<Convergence> {
        let document = self.get_json("serviceconverge").await?;
        serde_json::from_value(document)
            .map_err(|e| HarnessError::protocol(format!("unreadable serviceconverge response: {}", e)))
    }
}

/// Waits for all services to converge on a config generation
pub struct ConvergenceWaiter {
    source: Arc<dyn ConvergenceSource>,
    schedule: PollSchedule,
}

impl ConvergenceWaiter {
    pub const DEFAULT_BUDGET: Duration = Duration::from_secs(60);

    pub fn new(source: Arc<dyn ConvergenceSource>) -> Self {
        Self {
            source,
            schedule: PollSchedule::new(Duration::from_secs(1), Self::DEFAULT_BUDGET),
        }
    }

    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Wait for convergence and require it to be on `generation`
    pub async fn wait(&self, generation: i64) -> Result<Duration> {
        let started = Instant::now();
        let source = self.source.clone();
        let converged = poll_until(&self.schedule, || {
            let source = source.clone();
            async move {
                let state = source.convergence().await?;
                debug!("Convergence: {:?}", state);
                Ok::<_, HarnessError>(state.converged.then_some(state))
            }
        })
        .await
        .map_err(|e| {
            e.into_error(|elapsed| HarnessError::Timeout {
                phase: Phase::Start,
                elapsed,
            })
        })?;

        if converged.wanted_generation != generation {
            return Err(HarnessError::protocol(format!(
                "services converged on generation {}, expected {}",
                converged.wanted_generation, generation
            )));
        }

        let elapsed = started.elapsed();
        info!("Services converged on generation {} after {:?}", generation, elapsed);
        Ok(elapsed)
    }
}
