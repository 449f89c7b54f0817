//! Error handling for the Drover harness
//!
//! Every fatal error names the phase that failed and, where a deadline was
//! involved, how long the harness had been waiting when it gave up.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Phase of a benchmark or operation in which an error surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Launch,
    Sample,
    Run,
    Parse,
    Trigger,
    Start,
    Operation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Launch => write!(f, "launch"),
            Phase::Sample => write!(f, "sample"),
            Phase::Run => write!(f, "run"),
            Phase::Parse => write!(f, "parse"),
            Phase::Trigger => write!(f, "trigger"),
            Phase::Start => write!(f, "start"),
            Phase::Operation => write!(f, "operation"),
        }
    }
}

/// The main error type for the harness
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The external process could not be started
    #[error("[launch] could not start process on {host}: {reason}")]
    Launch { host: String, reason: String },

    /// A process or wait exceeded its deadline
    #[error("[{phase}] timed out after {elapsed:?}")]
    Timeout { phase: Phase, elapsed: Duration },

    /// The operation started but never reached a terminal state
    #[error("[operation] no terminal state within {elapsed:?}")]
    OperationTimeout { elapsed: Duration },

    /// The operation never started after being triggered
    #[error("[start] operation not started after {elapsed:?} (baseline {baseline_millis} ms)")]
    StartTimeout { baseline_millis: i64, elapsed: Duration },

    /// The remote endpoint rejected the trigger
    #[error("[trigger] {reason}")]
    Trigger { reason: String },

    /// The operation reached the failed terminal state
    #[error("[operation] operation failed after {elapsed:?} (started {started_millis} ms, ended {ended_millis} ms)")]
    OperationFailed {
        started_millis: i64,
        ended_millis: i64,
        elapsed: Duration,
    },

    /// Benchmark output was malformed
    #[error("[parse] {reason}")]
    Parse { reason: String },

    /// A status read failed in a way that may succeed on retry
    #[error("transient poll failure: {reason}")]
    TransientPoll { reason: String },

    /// A derived metric would have divided by zero
    #[error("division by zero while deriving {metric}")]
    DivisionByZero { metric: String },

    /// The remote endpoint answered with something we cannot interpret
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// A state machine was asked to make a transition it does not allow
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A remote command failed for a non-transient reason
    #[error("remote command failed on {host}: {reason}")]
    Remote { host: String, reason: String },

    /// Resource sampling failed
    #[error("[sample] {0}")]
    Sampler(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl HarnessError {
    pub fn launch(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Launch {
            host: host.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn trigger(reason: impl Into<String>) -> Self {
        Self::Trigger {
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientPoll {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn remote(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Remote {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Only transient poll failures may be retried; everything else is fatal
    pub fn is_retryable(&self) -> bool {
        matches!(self, HarnessError::TransientPoll { .. })
    }

    /// The phase this error belongs to, when it belongs to one
    pub fn phase(&self) -> Option<Phase> {
        match self {
            HarnessError::Launch { .. } => Some(Phase::Launch),
            HarnessError::Timeout { phase, .. } => Some(*phase),
            HarnessError::OperationTimeout { .. } | HarnessError::OperationFailed { .. } => {
                Some(Phase::Operation)
            }
            HarnessError::StartTimeout { .. } => Some(Phase::Start),
            HarnessError::Trigger { .. } => Some(Phase::Trigger),
            HarnessError::Parse { .. } | HarnessError::DivisionByZero { .. } => Some(Phase::Parse),
            HarnessError::Sampler(_) => Some(Phase::Sample),
            HarnessError::Remote { .. } => Some(Phase::Run),
            _ => None,
        }
    }

    /// Elapsed time at failure for deadline related errors
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            HarnessError::Timeout { elapsed, .. }
            | HarnessError::OperationTimeout { elapsed }
            | HarnessError::StartTimeout { elapsed, .. }
            | HarnessError::OperationFailed { elapsed, .. } => Some(*elapsed),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            HarnessError::Config(_) => 1,
            HarnessError::Launch { .. } => 2,
            HarnessError::Trigger { .. } => 3,
            HarnessError::Parse { .. } | HarnessError::DivisionByZero { .. } => 4,
            HarnessError::OperationFailed { .. } => 5,
            HarnessError::Timeout { .. }
            | HarnessError::OperationTimeout { .. }
            | HarnessError::StartTimeout { .. } => 124,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
