//! # Statistics Aggregator
//!
//! Reduces an `IterationSeries` to mean, median and sample standard deviation
//! per numeric field. Values are kept at full precision; rounding only
//! happens when a report is rendered, using the per-field `decimals`.

use serde::Serialize;

use crate::records::IterationSeries;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatsError {
    #[error("series '{0}' is empty")]
    EmptySeries(String),
}

/// Summary of one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSummary {
    pub name: &'static str,
    pub decimals: usize,
    pub mean: f64,
    pub median: f64,
    /// Sample standard deviation; `None` with fewer than two values.
    pub stdev: Option<f64>,
}

/// Summaries for every field of a series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSummary {
    pub series: String,
    pub count: usize,
    pub fields: Vec<FieldSummary>,
}

pub fn summarize(series: &IterationSeries) -> Result<AggregateSummary, StatsError> {
    if series.is_empty() {
        return Err(StatsError::EmptySeries(series.name().to_string()));
    }

    let fields = series
        .kind()
        .fields()
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            let values = series.column(index);
            FieldSummary {
                name: spec.name,
                decimals: spec.decimals,
                mean: mean(&values),
                median: median(&values),
                stdev: sample_stdev(&values),
            }
        })
        .collect();

    Ok(AggregateSummary {
        series: series.name().to_string(),
        count: series.len(),
        fields,
    })
}

pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Middle value, or the mean of the two middle values. Callers pass a
/// non-empty column; `summarize` rejects empty series first.
fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Two-pass sample standard deviation (n - 1).
pub fn sample_stdev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = mean(values);
    let squares: f64 = values.iter().map(|value| (value - mean).powi(2)).sum();
    Some((squares / (values.len() - 1) as f64).sqrt())
}
