//! Configuration management for the Drover harness

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// Main harness configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub process: ProcessSettings,
    pub polling: PollingSettings,
    pub sampling: SamplingSettings,
    pub output: OutputSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Ceiling for a single benchmark process; large feed runs take hours
    pub wait_timeout_secs: u64,
    /// Workers available for blocking process waits
    pub pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub interval_ms: u64,
    pub start_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub max_transient_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub directory: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            process: ProcessSettings::default(),
            polling: PollingSettings::default(),
            sampling: SamplingSettings::default(),
            output: OutputSettings::default(),
        }
    }
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 7200,
            pool_size: 1,
        }
    }
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            start_timeout_secs: 300,
            operation_timeout_secs: 1800,
            max_transient_retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 8000,
        }
    }
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: "./drover_results".to_string(),
        }
    }
}

impl ProcessSettings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

impl PollingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl SamplingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl HarnessConfig {
    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HarnessConfig =
            toml::from_str(&content).map_err(|e| HarnessError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| HarnessError::Config(e.to_string()))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn load_from_env() -> Result<Self> {
        let mut config = HarnessConfig::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `DROVER_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(value) = env_number("DROVER_WAIT_TIMEOUT_SECS")? {
            self.process.wait_timeout_secs = value;
        }

        if let Some(value) = env_number("DROVER_POLL_INTERVAL_MS")? {
            self.polling.interval_ms = value;
        }

        if let Some(value) = env_number("DROVER_START_TIMEOUT_SECS")? {
            self.polling.start_timeout_secs = value;
        }

        if let Some(value) = env_number("DROVER_OPERATION_TIMEOUT_SECS")? {
            self.polling.operation_timeout_secs = value;
        }

        if let Ok(directory) = std::env::var("DROVER_OUTPUT_DIR") {
            self.output.directory = directory;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.process.wait_timeout_secs == 0 {
            return Err(HarnessError::Config(
                "Process wait timeout must be greater than 0".to_string(),
            ));
        }

        if self.process.pool_size == 0 {
            return Err(HarnessError::Config(
                "Wait pool size must be greater than 0".to_string(),
            ));
        }

        if self.polling.interval_ms == 0 {
            return Err(HarnessError::Config(
                "Polling interval must be greater than 0".to_string(),
            ));
        }

        if self.polling.start_timeout_secs == 0 || self.polling.operation_timeout_secs == 0 {
            return Err(HarnessError::Config(
                "Polling timeouts must be greater than 0".to_string(),
            ));
        }

        if self.polling.start_timeout_secs > self.polling.operation_timeout_secs {
            return Err(HarnessError::Config(format!(
                "Start timeout ({}s) must not exceed operation timeout ({}s)",
                self.polling.start_timeout_secs, self.polling.operation_timeout_secs
            )));
        }

        if self.sampling.interval_ms == 0 {
            return Err(HarnessError::Config(
                "Sampling interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| HarnessError::Config(format!("{} is not a valid number: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
