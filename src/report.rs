//! # Report Renderer
//!
//! Turns series and their summaries into the final artifact. Two renderings
//! share one input:
//!
//! - **text**: CSV-compatible, the layout downstream spreadsheets already
//!   import (header lines, one table per series, then average / median /
//!   std dev rows)
//! - **json**: the same content as structured data
//!
//! Both are pure functions of their input. Rendering the same report twice
//! yields byte-identical output.

use serde::Serialize;

use crate::cli::ReportFormat;
use crate::records::{IterationSeries, MetricRecord};
use crate::stats::{AggregateSummary, FieldSummary};

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("{series} series but {summaries} summaries")]
    LengthMismatch { series: usize, summaries: usize },

    #[error("summary for '{found}' does not belong to series '{expected}'")]
    SeriesMismatch { expected: String, found: String },

    #[error("summary of '{series}' covers {summarized} iterations, series has {actual}")]
    StaleSummary {
        series: String,
        summarized: usize,
        actual: usize,
    },

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Report header lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportHeader {
    pub description: String,
    /// Command line of the measured tool
    pub command: String,
}

impl ReportHeader {
    pub fn new(description: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            command: command.into(),
        }
    }
}

/// Finished benchmark report. Outlives the run that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub header: ReportHeader,
    pub series: Vec<IterationSeries>,
    pub summaries: Vec<AggregateSummary>,
}

impl Report {
    pub fn render(&self, format: ReportFormat) -> Result<String, ReportError> {
        match format {
            ReportFormat::Text => render_text(&self.header, &self.series, &self.summaries),
            ReportFormat::Json => render_json(&self.header, &self.series, &self.summaries),
        }
    }
}

fn check_pairs(
    series: &[IterationSeries],
    summaries: &[AggregateSummary],
) -> Result<(), ReportError> {
    if series.len() != summaries.len() {
        return Err(ReportError::LengthMismatch {
            series: series.len(),
            summaries: summaries.len(),
        });
    }
    for (series, summary) in series.iter().zip(summaries) {
        if series.name() != summary.series {
            return Err(ReportError::SeriesMismatch {
                expected: series.name().to_string(),
                found: summary.series.clone(),
            });
        }
        if series.len() != summary.count {
            return Err(ReportError::StaleSummary {
                series: series.name().to_string(),
                summarized: summary.count,
                actual: series.len(),
            });
        }
    }
    Ok(())
}

fn format_row(label: &str, cells: impl Iterator<Item = String>) -> String {
    let mut row = label.to_string();
    for cell in cells {
        row.push(',');
        row.push_str(&cell);
    }
    row
}

/// Render the CSV-compatible text report.
///
/// ## Layout
///
/// ```text
/// Description,<description>
/// Command,<command>
///
/// <series name>
/// iteration,<field...>
/// 1,<values...>
///
/// average,<...>
/// median,<...>
/// std dev,<...>
/// ```
///
/// The `std dev` row is only present for series with at least two
/// iterations. Iterations are numbered from 1.
pub fn render_text(
    header: &ReportHeader,
    series: &[IterationSeries],
    summaries: &[AggregateSummary],
) -> Result<String, ReportError> {
    check_pairs(series, summaries)?;

    let mut lines = vec![
        format!("Description,{}", header.description),
        format!("Command,{}", header.command),
    ];

    for (series, summary) in series.iter().zip(summaries) {
        let fields = series.kind().fields();
        lines.push(String::new());
        lines.push(series.name().to_string());
        lines.push(format_row(
            "iteration",
            fields.iter().map(|f| f.name.to_string()),
        ));

        for (index, record) in series.records().iter().enumerate() {
            let cells = record
                .values()
                .into_iter()
                .zip(fields)
                .map(|(value, spec)| format!("{:.*}", spec.decimals, value));
            lines.push(format_row(&(index + 1).to_string(), cells));
        }

        lines.push(String::new());
        lines.push(summary_row("average", summary, |f| Some(f.mean)));
        lines.push(summary_row("median", summary, |f| Some(f.median)));
        if summary.count > 1 {
            lines.push(summary_row("std dev", summary, |f| f.stdev));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

fn summary_row(
    label: &str,
    summary: &AggregateSummary,
    statistic: impl Fn(&FieldSummary) -> Option<f64>,
) -> String {
    format_row(
        label,
        summary.fields.iter().map(|f| match statistic(f) {
            Some(value) => format!("{:.*}", f.decimals, value),
            None => String::new(),
        }),
    )
}

#[derive(Serialize)]
struct JsonReport<'a> {
    description: &'a str,
    command: &'a str,
    series: Vec<JsonSeries<'a>>,
}

#[derive(Serialize)]
struct JsonSeries<'a> {
    name: &'a str,
    iterations: Vec<JsonIteration<'a>>,
    summary: &'a AggregateSummary,
}

#[derive(Serialize)]
struct JsonIteration<'a> {
    iteration: usize,
    record: &'a MetricRecord,
}

/// Render the same content as [`render_text`] as pretty-printed JSON.
pub fn render_json(
    header: &ReportHeader,
    series: &[IterationSeries],
    summaries: &[AggregateSummary],
) -> Result<String, ReportError> {
    check_pairs(series, summaries)?;

    let report = JsonReport {
        description: &header.description,
        command: &header.command,
        series: series
            .iter()
            .zip(summaries)
            .map(|(series, summary)| JsonSeries {
                name: series.name(),
                iterations: series
                    .records()
                    .iter()
                    .enumerate()
                    .map(|(index, record)| JsonIteration {
                        iteration: index + 1,
                        record,
                    })
                    .collect(),
                summary,
            })
            .collect(),
    };
    let mut json = serde_json::to_string_pretty(&report)?;
    json.push('\n');
    Ok(json)
}
