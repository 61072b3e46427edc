//! # Parser Registry
//!
//! Maps a capture kind to the pure function that turns that tool's raw output
//! into a `MetricRecord`. The kind always comes from the workload that produced
//! the capture; content is never sniffed.
//!
//! Parsers hold no state, never retry, and each reports its own
//! `ParseError` variant so a failed run names the offending tool.

use serde::Serialize;

use crate::error::ParseError;
use crate::records::{IoOperation, MetricRecord, NetperfTest};

pub mod fio;
pub mod lsblk;
pub mod netperf;
pub mod stress_ng;
pub mod systemd;

/// Which tool produced a capture, and which sub-test for tools with several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CaptureKind {
    /// `systemd-analyze` text
    BootTiming,
    /// fio `--output-format=json` for one operation
    IoJson(IoOperation),
    /// netperf text for one sub-test
    Throughput(NetperfTest),
    /// `stress-ng --metrics-brief` text
    StressText,
}

impl CaptureKind {
    /// Leading component of persisted capture file names.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            CaptureKind::BootTiming => "boot",
            CaptureKind::IoJson(_) => "fio",
            CaptureKind::Throughput(_) => "netperf",
            CaptureKind::StressText => "stress",
        }
    }

    /// Recover the kind from a persisted capture name such as
    /// `netperf-TCP_RR-i2-20240501-101500.log` or `fio-read-i1-....log`.
    ///
    /// Report files (`results-...`) and unknown prefixes yield `None`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".log")?;
        let mut parts = stem.splitn(3, '-');
        let prefix = parts.next()?;
        let tag = parts.next()?;
        let rest = parts.next()?;
        // Every capture carries an iteration marker after the tag.
        if !rest.starts_with('i') {
            return None;
        }

        match prefix {
            "boot" => Some(CaptureKind::BootTiming),
            "fio" => IoOperation::from_name(tag).map(CaptureKind::IoJson),
            "netperf" => NetperfTest::from_name(tag).map(CaptureKind::Throughput),
            "stress" => Some(CaptureKind::StressText),
            _ => None,
        }
    }
}

/// One unparsed workload output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawCapture {
    pub kind: CaptureKind,
    /// Series the parsed record is appended to
    pub series: String,
    /// 1-based iteration index
    pub iteration: usize,
    /// File-name tag (`initial`, `reboot`, `read`, `TCP_RR`, ...)
    pub tag: String,
    pub content: String,
}

impl RawCapture {
    pub fn new(
        kind: CaptureKind,
        series: impl Into<String>,
        iteration: usize,
        tag: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            series: series.into(),
            iteration,
            tag: tag.into(),
            content: content.into(),
        }
    }
}

/// Dispatch a capture to its parser.
pub fn parse(capture: &RawCapture) -> Result<MetricRecord, ParseError> {
    parse_content(capture.kind, &capture.content)
}

/// Same as [`parse`] for content that is not wrapped in a `RawCapture`.
pub fn parse_content(kind: CaptureKind, content: &str) -> Result<MetricRecord, ParseError> {
    match kind {
        CaptureKind::BootTiming => systemd::parse_boot_timing(content),
        CaptureKind::IoJson(operation) => fio::parse_io_json(content, operation),
        CaptureKind::Throughput(test) => netperf::parse_throughput(content, test),
        CaptureKind::StressText => stress_ng::parse_stress_text(content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_file_name() {
        assert_eq!(
            CaptureKind::from_file_name("netperf-TCP_RR-i2-20240501-101500.log"),
            Some(CaptureKind::Throughput(NetperfTest::TcpRr))
        );
        assert_eq!(
            CaptureKind::from_file_name("fio-read-i1-20240501-101500.log"),
            Some(CaptureKind::IoJson(IoOperation::Read))
        );
        assert_eq!(
            CaptureKind::from_file_name("fio-randwrite-i4-20240501-101500.log"),
            Some(CaptureKind::IoJson(IoOperation::RandWrite))
        );
        assert_eq!(
            CaptureKind::from_file_name("boot-reboot-i10-20240501-101500.log"),
            Some(CaptureKind::BootTiming)
        );
        assert_eq!(
            CaptureKind::from_file_name("stress-matrix-i3-20240501-101500.log"),
            Some(CaptureKind::StressText)
        );
    }

    #[test]
    fn test_from_file_name_rejects_other_files() {
        assert_eq!(CaptureKind::from_file_name("results-boot-20240501-101500.log"), None);
        assert_eq!(CaptureKind::from_file_name("fio-randrw-i1-20240501.log"), None);
        assert_eq!(CaptureKind::from_file_name("netperf-TCP_RR-i1.json"), None);
        assert_eq!(CaptureKind::from_file_name("notes.log"), None);
        assert_eq!(CaptureKind::from_file_name("info-fio-20240501-101500.json"), None);
    }

    #[test]
    fn test_file_prefix_round_trips() {
        for kind in [
            CaptureKind::BootTiming,
            CaptureKind::IoJson(IoOperation::Write),
            CaptureKind::Throughput(NetperfTest::UdpStream),
            CaptureKind::StressText,
        ] {
            let tag = match kind {
                CaptureKind::IoJson(op) => op.as_str().to_string(),
                CaptureKind::Throughput(test) => test.as_str().to_string(),
                _ => "x".to_string(),
            };
            let name = format!("{}-{}-i1-20240501-000000.log", kind.file_prefix(), tag);
            assert_eq!(CaptureKind::from_file_name(&name), Some(kind));
        }
    }

    #[test]
    fn test_dispatch_uses_declared_kind() {
        let capture = RawCapture::new(
            CaptureKind::StressText,
            "Matrix",
            1,
            "matrix",
            "Startup finished in 1.000s (kernel) + 2.000s (userspace)",
        );
        assert!(matches!(
            parse(&capture),
            Err(ParseError::MalformedStressOutput(_))
        ));
    }
}
