use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;
use tracing::{debug, info};

use drover_harness::report::{evaluate, graphs_from_bounds, BoundsTable};
use drover_harness::{GraphSpec, ReportRecord};

use crate::error::CliError;
use crate::output::OutputManager;

#[derive(Args, Debug)]
pub struct CheckGraphsArgs {
    /// Reports as JSON lines, as written by `feed` or `reindex`
    #[arg(long)]
    pub reports: PathBuf,

    /// TOML table of legend -> metric -> { y_min, y_max }
    #[arg(long)]
    pub bounds: Option<PathBuf>,

    /// JSON file with a list of graph descriptors
    #[arg(long)]
    pub graphs: Option<PathBuf>,
}

/// One stored report line; graphs are optional
#[derive(Debug, Deserialize)]
struct StoredReport {
    #[serde(flatten)]
    record: ReportRecord,
    #[serde(default)]
    graphs: Vec<GraphSpec>,
}

pub fn run(args: CheckGraphsArgs, output: OutputManager) -> Result<()> {
    let stored = load_reports(&args.reports)?;
    let mut graphs: Vec<GraphSpec> = Vec::new();

    if let Some(path) = &args.bounds {
        graphs.extend(graphs_from_bounds(&load_bounds(path)?));
    }
    if let Some(path) = &args.graphs {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read graphs from {}", path.display()))?;
        let declared: Vec<GraphSpec> = serde_json::from_str(&text)
            .with_context(|| format!("Invalid graphs file {}", path.display()))?;
        graphs.extend(declared);
    }
    for report in &stored {
        for graph in &report.graphs {
            if !graphs.contains(graph) {
                graphs.push(graph.clone());
            }
        }
    }

    let records: Vec<ReportRecord> = stored.into_iter().map(|report| report.record).collect();
    info!("Checking {} records against {} graphs", records.len(), graphs.len());

    let violations = evaluate(&graphs, &records);
    output.print_violations(&violations)?;

    if violations.is_empty() {
        output.print_success(&format!(
            "{} records within bounds of {} graphs",
            records.len(),
            graphs.len()
        ));
        Ok(())
    } else {
        Err(CliError::BoundsViolated(violations.len()).into())
    }
}

fn load_reports(path: &Path) -> Result<Vec<StoredReport>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read reports from {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid report", path.display(), number + 1))
        })
        .collect()
}

fn load_bounds(path: &Path) -> Result<BoundsTable> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read bounds from {}", path.display()))?;
    let table: BoundsTable =
        toml::from_str(&text).with_context(|| format!("Invalid bounds file {}", path.display()))?;
    debug!("Loaded bounds for {} legends", table.len());
    Ok(table)
}
