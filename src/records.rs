//! Typed metric records, one shape per benchmark kind, and the named
//! per-iteration series they accumulate into.
//!
//! Records are validated at construction: every numeric field must be finite
//! and non-negative, otherwise construction fails with
//! `ParseError::InvalidMetric` and no partially populated record exists.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ParseError;

/// Kind of a metric record. Each benchmark kind produces exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Boot,
    Io,
    Network,
    Stress,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Boot => write!(f, "boot"),
            MetricKind::Io => write!(f, "io"),
            MetricKind::Network => write!(f, "network"),
            MetricKind::Stress => write!(f, "stress"),
        }
    }
}

/// fio operation a capture was taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoOperation {
    Read,
    Write,
    RandRead,
    RandWrite,
}

impl IoOperation {
    pub const SEQUENTIAL: [IoOperation; 2] = [IoOperation::Read, IoOperation::Write];
    pub const RANDOM: [IoOperation; 2] = [IoOperation::RandRead, IoOperation::RandWrite];

    /// fio's `--readwrite` value, also used as the capture file tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            IoOperation::Read => "read",
            IoOperation::Write => "write",
            IoOperation::RandRead => "randread",
            IoOperation::RandWrite => "randwrite",
        }
    }

    /// Key under `jobs[0]` in fio's JSON output.
    pub fn section(&self) -> &'static str {
        match self {
            IoOperation::Read | IoOperation::RandRead => "read",
            IoOperation::Write | IoOperation::RandWrite => "write",
        }
    }

    pub fn is_random(&self) -> bool {
        matches!(self, IoOperation::RandRead | IoOperation::RandWrite)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "read" => Some(IoOperation::Read),
            "write" => Some(IoOperation::Write),
            "randread" => Some(IoOperation::RandRead),
            "randwrite" => Some(IoOperation::RandWrite),
            _ => None,
        }
    }
}

impl fmt::Display for IoOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// netperf sub-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetperfTest {
    TcpStream,
    TcpMaerts,
    UdpStream,
    TcpRr,
    UdpRr,
}

impl NetperfTest {
    /// Test name as passed to `netperf -t`.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetperfTest::TcpStream => "TCP_STREAM",
            NetperfTest::TcpMaerts => "TCP_MAERTS",
            NetperfTest::UdpStream => "UDP_STREAM",
            NetperfTest::TcpRr => "TCP_RR",
            NetperfTest::UdpRr => "UDP_RR",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "TCP_STREAM" => Some(NetperfTest::TcpStream),
            "TCP_MAERTS" => Some(NetperfTest::TcpMaerts),
            "UDP_STREAM" => Some(NetperfTest::UdpStream),
            "TCP_RR" => Some(NetperfTest::TcpRr),
            "UDP_RR" => Some(NetperfTest::UdpRr),
            _ => None,
        }
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            NetperfTest::TcpStream | NetperfTest::TcpMaerts | NetperfTest::TcpRr => "TCP",
            NetperfTest::UdpStream | NetperfTest::UdpRr => "UDP",
        }
    }

    pub fn is_request_response(&self) -> bool {
        matches!(self, NetperfTest::TcpRr | NetperfTest::UdpRr)
    }
}

impl fmt::Display for NetperfTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column metadata for one numeric field of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Presentation precision; stored values are never rounded.
    pub decimals: usize,
}

const fn field(name: &'static str, decimals: usize) -> FieldSpec {
    FieldSpec { name, decimals }
}

const BOOT_FIELDS: &[FieldSpec] = &[
    field("firmware", 3),
    field("loader", 3),
    field("kernel", 3),
    field("userspace", 3),
    field("total", 3),
];

const IO_FIELDS: &[FieldSpec] = &[
    field("iops", 2),
    field("bw", 2),
    field("io", 0),
    field("mean disk util", 2),
];

const NETWORK_FIELDS: &[FieldSpec] = &[field("throughput", 2)];

const STRESS_FIELDS: &[FieldSpec] = &[field("bogo ops/s (real time)", 2)];

impl MetricKind {
    /// Numeric fields in column order.
    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            MetricKind::Boot => BOOT_FIELDS,
            MetricKind::Io => IO_FIELDS,
            MetricKind::Network => NETWORK_FIELDS,
            MetricKind::Stress => STRESS_FIELDS,
        }
    }
}

/// Structured result of parsing one raw capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricRecord {
    /// Boot phase durations, in seconds.
    Boot {
        firmware: f64,
        loader: f64,
        kernel: f64,
        userspace: f64,
        total: f64,
    },
    Io {
        operation: IoOperation,
        iops: f64,
        /// KiB/s as reported by fio
        bandwidth: f64,
        io_bytes: f64,
        disk_util_mean: f64,
    },
    Network {
        protocol: String,
        test: NetperfTest,
        throughput: f64,
    },
    Stress { bogo_ops_real: f64 },
}

fn check(field: &'static str, value: f64) -> Result<f64, ParseError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ParseError::InvalidMetric { field, value })
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

impl MetricRecord {
    /// Boot record; `total` is the phase sum rounded to 3 decimals.
    pub fn boot(firmware: f64, loader: f64, kernel: f64, userspace: f64) -> Result<Self, ParseError> {
        let firmware = check("firmware", firmware)?;
        let loader = check("loader", loader)?;
        let kernel = check("kernel", kernel)?;
        let userspace = check("userspace", userspace)?;
        let total = check("total", round3(firmware + loader + kernel + userspace))?;
        Ok(MetricRecord::Boot {
            firmware,
            loader,
            kernel,
            userspace,
            total,
        })
    }

    pub fn io(
        operation: IoOperation,
        iops: f64,
        bandwidth: f64,
        io_bytes: f64,
        disk_util_mean: f64,
    ) -> Result<Self, ParseError> {
        Ok(MetricRecord::Io {
            operation,
            iops: check("iops", iops)?,
            bandwidth: check("bandwidth", bandwidth)?,
            io_bytes: check("io_bytes", io_bytes)?,
            disk_util_mean: check("disk_util_mean", disk_util_mean)?,
        })
    }

    pub fn network(test: NetperfTest, throughput: f64) -> Result<Self, ParseError> {
        Ok(MetricRecord::Network {
            protocol: test.protocol().to_string(),
            test,
            throughput: check("throughput", throughput)?,
        })
    }

    pub fn stress(bogo_ops_real: f64) -> Result<Self, ParseError> {
        Ok(MetricRecord::Stress {
            bogo_ops_real: check("bogo_ops_real", bogo_ops_real)?,
        })
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricRecord::Boot { .. } => MetricKind::Boot,
            MetricRecord::Io { .. } => MetricKind::Io,
            MetricRecord::Network { .. } => MetricKind::Network,
            MetricRecord::Stress { .. } => MetricKind::Stress,
        }
    }

    /// Numeric values in the column order of `self.kind().fields()`.
    pub fn values(&self) -> Vec<f64> {
        match self {
            MetricRecord::Boot {
                firmware,
                loader,
                kernel,
                userspace,
                total,
            } => vec![*firmware, *loader, *kernel, *userspace, *total],
            MetricRecord::Io {
                iops,
                bandwidth,
                io_bytes,
                disk_util_mean,
                ..
            } => vec![*iops, *bandwidth, *io_bytes, *disk_util_mean],
            MetricRecord::Network { throughput, .. } => vec![*throughput],
            MetricRecord::Stress { bogo_ops_real } => vec![*bogo_ops_real],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeriesError {
    #[error("series '{series}' holds {expected} records, cannot append a {found} record")]
    KindMismatch {
        series: String,
        expected: MetricKind,
        found: MetricKind,
    },

    #[error("capture names unknown series '{0}'")]
    UnknownSeries(String),
}

/// Named, ordered sequence of records of a single kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationSeries {
    name: String,
    kind: MetricKind,
    records: Vec<MetricRecord>,
}

impl IterationSeries {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: MetricRecord) -> Result<(), SeriesError> {
        if record.kind() != self.kind {
            return Err(SeriesError::KindMismatch {
                series: self.name.clone(),
                expected: self.kind,
                found: record.kind(),
            });
        }
        self.records.push(record);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn records(&self) -> &[MetricRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All values of one column, in insertion order.
    pub fn column(&self, index: usize) -> Vec<f64> {
        self.records
            .iter()
            .filter_map(|record| record.values().get(index).copied())
            .collect()
    }
}
