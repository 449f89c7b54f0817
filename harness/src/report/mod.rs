//! Report records and the fillers that populate them
//!
//! A [`ReportRecord`] starts empty and is built by applying an ordered list of
//! [`ReportFiller`]s. Parameters describe the run (label, client count, ...);
//! metrics are the measured values. The two live in separate namespaces, and a
//! later filler overwrites an earlier value under the same key.

pub mod graph;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use graph::{evaluate, graphs_from_bounds, BoundViolation, Bounds, BoundsTable, GraphSpec};

/// A parameter or metric value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportValue {
    Number(f64),
    Text(String),
}

impl ReportValue {
    /// Numeric view of the value; text is parsed when it holds a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ReportValue::Number(n) => Some(*n),
            ReportValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Convert a JSON scalar; objects, arrays and null have no report form
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(ReportValue::Number),
            serde_json::Value::String(s) => Some(ReportValue::Text(s.clone())),
            serde_json::Value::Bool(b) => Some(ReportValue::Text(b.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for ReportValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportValue::Number(n) => write!(f, "{}", n),
            ReportValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for ReportValue {
    fn from(value: f64) -> Self {
        ReportValue::Number(value)
    }
}

impl From<i64> for ReportValue {
    fn from(value: i64) -> Self {
        ReportValue::Number(value as f64)
    }
}

impl From<u64> for ReportValue {
    fn from(value: u64) -> Self {
        ReportValue::Number(value as f64)
    }
}

impl From<u32> for ReportValue {
    fn from(value: u32) -> Self {
        ReportValue::Number(value as f64)
    }
}

impl From<usize> for ReportValue {
    fn from(value: usize) -> Self {
        ReportValue::Number(value as f64)
    }
}

impl From<bool> for ReportValue {
    fn from(value: bool) -> Self {
        ReportValue::Text(value.to_string())
    }
}

impl From<&str> for ReportValue {
    fn from(value: &str) -> Self {
        ReportValue::Text(value.to_string())
    }
}

impl From<String> for ReportValue {
    fn from(value: String) -> Self {
        ReportValue::Text(value)
    }
}

/// A named measurement, immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: ReportValue,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, value: impl Into<ReportValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Parameters and metrics for one benchmark run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub parameters: BTreeMap<String, ReportValue>,
    pub metrics: BTreeMap<String, ReportValue>,
}

impl ReportRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record by applying fillers in order to an empty record
    pub fn from_fillers(fillers: &[BoxedFiller]) -> Self {
        let mut record = Self::new();
        for filler in fillers {
            record.apply(filler.as_ref());
        }
        record
    }

    pub fn apply(&mut self, filler: &dyn ReportFiller) {
        filler.apply(self);
    }

    pub fn add_parameter(&mut self, name: impl Into<String>, value: impl Into<ReportValue>) {
        self.parameters.insert(name.into(), value.into());
    }

    pub fn add_metric(&mut self, name: impl Into<String>, value: impl Into<ReportValue>) {
        self.metrics.insert(name.into(), value.into());
    }

    pub fn parameter(&self, name: &str) -> Option<&ReportValue> {
        self.parameters.get(name)
    }

    pub fn metric(&self, name: &str) -> Option<&ReportValue> {
        self.metrics.get(name)
    }

    pub fn metric_f64(&self, name: &str) -> Option<f64> {
        self.metric(name).and_then(ReportValue::as_f64)
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.metrics.is_empty()
    }

    /// Filler copying every entry of this record
    pub fn into_filler(self) -> BoxedFiller {
        Box::new(move |record: &mut ReportRecord| {
            for (name, value) in &self.parameters {
                record.add_parameter(name.clone(), value.clone());
            }
            for (name, value) in &self.metrics {
                record.add_metric(name.clone(), value.clone());
            }
        })
    }
}

/// Something that writes named parameters or metrics into a record
pub trait ReportFiller: Send + Sync {
    fn apply(&self, record: &mut ReportRecord);
}

impl<F> ReportFiller for F
where
    F: Fn(&mut ReportRecord) + Send + Sync,
{
    fn apply(&self, record: &mut ReportRecord) {
        self(record)
    }
}

pub type BoxedFiller = Box<dyn ReportFiller>;

/// Filler adding a single parameter
pub fn parameter_filler(name: impl Into<String>, value: impl Into<ReportValue>) -> BoxedFiller {
    let name = name.into();
    let value = value.into();
    Box::new(move |record: &mut ReportRecord| {
        record.add_parameter(name.clone(), value.clone());
    })
}

/// Filler adding a single metric
pub fn metric_filler(name: impl Into<String>, value: impl Into<ReportValue>) -> BoxedFiller {
    let name = name.into();
    let value = value.into();
    Box::new(move |record: &mut ReportRecord| {
        record.add_metric(name.clone(), value.clone());
    })
}

/// Filler adding every sample as a metric
pub fn samples_filler(samples: Vec<MetricSample>) -> BoxedFiller {
    Box::new(move |record: &mut ReportRecord| {
        for sample in &samples {
            record.add_metric(sample.name.clone(), sample.value.clone());
        }
    })
}

/// Filler splitting samples by prefix: keys starting with `metric_prefix`
/// become metrics, the rest become parameters.
pub fn prefixed_filler(samples: Vec<MetricSample>, metric_prefix: &str) -> BoxedFiller {
    let metric_prefix = metric_prefix.to_string();
    Box::new(move |record: &mut ReportRecord| {
        for sample in &samples {
            if sample.name.starts_with(&metric_prefix) {
                record.add_metric(sample.name.clone(), sample.value.clone());
            } else {
                record.add_parameter(sample.name.clone(), sample.value.clone());
            }
        }
    })
}

/// Filler for a flat JSON object using the `feeder.` metric convention
pub fn json_to_filler(object: &serde_json::Map<String, serde_json::Value>) -> BoxedFiller {
    let samples = object
        .iter()
        .filter_map(|(key, value)| {
            ReportValue::from_json(value).map(|value| MetricSample::new(key.clone(), value))
        })
        .collect();
    prefixed_filler(samples, "feeder.")
}

/// Accumulated result of one benchmark run together with its graphs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub created_at: DateTime<Utc>,
    pub record: ReportRecord,
    pub graphs: Vec<GraphSpec>,
}

impl MetricsReport {
    pub fn new(graphs: Vec<GraphSpec>) -> Self {
        Self {
            created_at: Utc::now(),
            record: ReportRecord::new(),
            graphs,
        }
    }

    pub fn from_fillers(fillers: &[BoxedFiller], graphs: Vec<GraphSpec>) -> Self {
        Self {
            created_at: Utc::now(),
            record: ReportRecord::from_fillers(fillers),
            graphs,
        }
    }

    pub fn apply(&mut self, filler: &dyn ReportFiller) {
        self.record.apply(filler);
    }

    /// Graph bound violations for this report's own record
    pub fn violations(&self) -> Vec<BoundViolation> {
        self.graphs
            .iter()
            .filter_map(|graph| graph.check(&self.record))
            .collect()
    }

    /// Structured form handed to the downstream sink
    pub fn render(&self) -> serde_json::Value {
        serde_json::json!({
            "created_at": self.created_at.to_rfc3339(),
            "parameters": self.record.parameters,
            "metrics": self.record.metrics,
            "graphs": self.graphs,
        })
    }
}
