//! stress-ng `--metrics-brief` output for the matrix stressor.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::ParseError;
use crate::records::MetricRecord;

const MATRIX_LINE: &str = r"stress-ng:\sinfo:\s+\[\d+\]\smatrix\s+(.+?)(?:\n|$)";

/// Column of "bogo ops/s (real time)" after the stressor name.
const BOGO_OPS_REAL_FIELD: usize = 4;

fn matrix_line() -> Result<&'static Regex, ParseError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(MATRIX_LINE))
        .as_ref()
        .map_err(|e| ParseError::MalformedStressOutput(format!("bad pattern: {}", e)))
}

pub fn parse_stress_text(content: &str) -> Result<MetricRecord, ParseError> {
    let pattern = matrix_line()?;

    let fields = pattern
        .captures(content)
        .and_then(|captures| captures.get(1))
        .ok_or_else(|| ParseError::MalformedStressOutput("no matrix metrics line".to_string()))?
        .as_str();

    let value = fields
        .split_whitespace()
        .nth(BOGO_OPS_REAL_FIELD)
        .ok_or_else(|| {
            ParseError::MalformedStressOutput(format!("matrix line too short: '{}'", fields))
        })?;
    let bogo_ops_real = value.parse::<f64>().map_err(|_| {
        ParseError::MalformedStressOutput(format!("'{}' is not a number", value))
    })?;

    MetricRecord::stress(bogo_ops_real)
}
