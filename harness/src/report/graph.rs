//! Graph descriptors and historic bound checks
//!
//! A [`GraphSpec`] selects report records by exact parameter match and plots
//! one metric. An optional `[y_min, y_max]` band marks the acceptable range;
//! values outside it are flagged as regressions but never fail a run here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ReportRecord, ReportValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub title: String,
    pub x: String,
    pub y: String,
    #[serde(default)]
    pub filter: BTreeMap<String, ReportValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_max: Option<f64>,
    #[serde(default)]
    pub historic: bool,
}

/// Acceptable band for a metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub y_min: Option<f64>,
    pub y_max: Option<f64>,
}

impl Bounds {
    pub fn new(y_min: f64, y_max: f64) -> Self {
        Self {
            y_min: Some(y_min),
            y_max: Some(y_max),
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.y_min.map_or(true, |min| value >= min) && self.y_max.map_or(true, |max| value <= max)
    }
}

/// Legend → metric → bounds, as declared next to a scenario
pub type BoundsTable = BTreeMap<String, BTreeMap<String, Bounds>>;

/// A matched record whose metric fell outside its graph's band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundViolation {
    pub title: String,
    pub metric: String,
    pub value: f64,
    pub y_min: Option<f64>,
    pub y_max: Option<f64>,
}

impl GraphSpec {
    pub fn new(title: impl Into<String>, x: impl Into<String>, y: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            x: x.into(),
            y: y.into(),
            filter: BTreeMap::new(),
            y_min: None,
            y_max: None,
            historic: false,
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<ReportValue>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.y_min = bounds.y_min;
        self.y_max = bounds.y_max;
        self
    }

    pub fn historic(mut self, historic: bool) -> Self {
        self.historic = historic;
        self
    }

    pub fn bounds(&self) -> Bounds {
        Bounds {
            y_min: self.y_min,
            y_max: self.y_max,
        }
    }

    /// True iff every filter entry equals the record's parameter of that name
    pub fn matches(&self, record: &ReportRecord) -> bool {
        self.filter
            .iter()
            .all(|(key, expected)| record.parameter(key) == Some(expected))
    }

    /// Records this graph would plot
    pub fn select<'a>(&self, records: &'a [ReportRecord]) -> Vec<&'a ReportRecord> {
        records.iter().filter(|record| self.matches(record)).collect()
    }

    /// Flag a matched record whose y metric falls outside the band
    pub fn check(&self, record: &ReportRecord) -> Option<BoundViolation> {
        if self.y_min.is_none() && self.y_max.is_none() {
            return None;
        }
        if !self.matches(record) {
            return None;
        }

        let value = record.metric_f64(&self.y)?;
        if self.bounds().contains(value) {
            return None;
        }

        warn!(
            "{}: {} = {} outside [{:?}, {:?}]",
            self.title, self.y, value, self.y_min, self.y_max
        );
        Some(BoundViolation {
            title: self.title.clone(),
            metric: self.y.clone(),
            value,
            y_min: self.y_min,
            y_max: self.y_max,
        })
    }
}

/// Check every record against every graph
pub fn evaluate(graphs: &[GraphSpec], records: &[ReportRecord]) -> Vec<BoundViolation> {
    graphs
        .iter()
        .flat_map(|graph| records.iter().filter_map(move |record| graph.check(record)))
        .collect()
}

/// One historic graph per (legend, metric) pair, filtered on `legend`
pub fn graphs_from_bounds(table: &BoundsTable) -> Vec<GraphSpec> {
    table
        .iter()
        .flat_map(|(legend, metrics)| {
            metrics.iter().map(move |(metric, bounds)| {
                GraphSpec::new(format!("{} for {}", metric, legend), "blank", metric.clone())
                    .with_filter("legend", legend.clone())
                    .with_bounds(*bounds)
                    .historic(true)
            })
        })
        .collect()
}
