//! fio JSON output (`--output-format=json --group_reporting=1`).

use serde::Deserialize;
use std::collections::HashMap;

use crate::error::ParseError;
use crate::records::{IoOperation, MetricRecord};

#[derive(Debug, Deserialize)]
struct FioOutput {
    jobs: Vec<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    disk_util: Vec<DiskUtil>,
}

#[derive(Debug, Deserialize)]
struct OperationStats {
    iops: f64,
    bw: f64,
    io_bytes: f64,
}

#[derive(Debug, Deserialize)]
struct DiskUtil {
    util: f64,
}

fn malformed(message: impl Into<String>) -> ParseError {
    ParseError::MalformedIoOutput(message.into())
}

pub fn parse_io_json(content: &str, operation: IoOperation) -> Result<MetricRecord, ParseError> {
    let output: FioOutput = serde_json::from_str(content).map_err(|e| malformed(e.to_string()))?;

    let job = output
        .jobs
        .first()
        .ok_or_else(|| malformed("no jobs in output"))?;
    let section = job
        .get(operation.section())
        .ok_or_else(|| malformed(format!("job has no '{}' section", operation.section())))?;
    let stats = OperationStats::deserialize(section)
        .map_err(|e| malformed(format!("{} section: {}", operation, e)))?;

    if output.disk_util.is_empty() {
        return Err(malformed("empty disk_util"));
    }
    let disk_util_mean =
        output.disk_util.iter().map(|disk| disk.util).sum::<f64>() / output.disk_util.len() as f64;

    MetricRecord::io(operation, stats.iops, stats.bw, stats.io_bytes, disk_util_mean)
}
