use std::time::Duration;

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use drover_harness::report::BoundViolation;
use drover_harness::{MetricsReport, ReportRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}

pub struct OutputManager {
    format: OutputFormat,
    colored: bool,
}

impl OutputManager {
    pub fn new(format: OutputFormat, colored: bool) -> Self {
        Self { format, colored }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn print_report(&self, report: &MetricsReport) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&report.render())?);
            }
            OutputFormat::Table => self.print_record_table(&report.record),
        }
        Ok(())
    }

    fn print_record_table(&self, record: &ReportRecord) {
        let width = record
            .parameters
            .keys()
            .chain(record.metrics.keys())
            .map(String::len)
            .max()
            .unwrap_or(0);

        self.print_heading("Parameters");
        for (name, value) in &record.parameters {
            println!("  {:<width$}  {}", name, value, width = width);
        }
        self.print_heading("Metrics");
        for (name, value) in &record.metrics {
            println!("  {:<width$}  {}", name, value, width = width);
        }
    }

    pub fn print_violations(&self, violations: &[BoundViolation]) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(violations)?);
            }
            OutputFormat::Table => {
                for violation in violations {
                    self.print_warning(&format!(
                        "{}: {} = {} outside [{}, {}]",
                        violation.title,
                        violation.metric,
                        violation.value,
                        bound(violation.y_min),
                        bound(violation.y_max)
                    ));
                }
            }
        }
        Ok(())
    }

    fn print_heading(&self, heading: &str) {
        if self.colored {
            println!("{}", style(heading).bold().underlined());
        } else {
            println!("{}", heading);
        }
    }

    pub fn print_success(&self, message: &str) {
        if self.format == OutputFormat::Json {
            return;
        }
        if self.colored {
            println!("{} {}", style("✓").green().bold(), message);
        } else {
            println!("✓ {}", message);
        }
    }

    pub fn print_warning(&self, message: &str) {
        if self.colored {
            println!("{} {}", style("⚠").yellow().bold(), message);
        } else {
            println!("⚠ {}", message);
        }
    }

    pub fn print_info(&self, message: &str) {
        if self.format == OutputFormat::Json {
            return;
        }
        if self.colored {
            println!("{} {}", style("ℹ").blue().bold(), message);
        } else {
            println!("ℹ {}", message);
        }
    }

    /// Spinner shown while waiting on a long-running remote step
    pub fn create_spinner(&self, message: &str) -> ProgressBar {
        if self.format == OutputFormat::Json {
            return ProgressBar::hidden();
        }
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(120));
        spinner
    }
}

fn bound(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
