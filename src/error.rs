//! # Error Taxonomy
//!
//! Every failure a benchmark run can hit maps onto one of the enums below.
//! Collaborator errors (`CloudError`) carry a transient/fatal classification
//! that the readiness poller consults; parser errors are always fatal and
//! each parser owns a distinct variant so callers can tell exactly which
//! capture was malformed.
//!
//! `BenchError` is the run-level error. The state machine wraps it in a
//! `RunError` that also records the stage the run was in when it failed.

use std::fmt;
use std::time::Duration;

use crate::poller::TransientError;

/// How a remote command channel refused to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// The remote end actively refused the connection (sshd not up yet)
    Refused,
    /// The connection attempt timed out (instance still booting or no route yet)
    TimedOut,
    /// sshd closed or reset the connection, as it does while the host reboots
    Dropped,
    /// Anything else: authentication failure, host key mismatch, DNS, ...
    Other,
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionErrorKind::Refused => write!(f, "connection refused"),
            ConnectionErrorKind::TimedOut => write!(f, "connection timed out"),
            ConnectionErrorKind::Dropped => write!(f, "connection dropped"),
            ConnectionErrorKind::Other => write!(f, "connection failed"),
        }
    }
}

/// Failure to open the remote command channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
}

impl ConnectionError {
    pub fn new(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Refused, timed-out and dropped connections are expected while an
    /// instance boots or reboots.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ConnectionErrorKind::Refused
                | ConnectionErrorKind::TimedOut
                | ConnectionErrorKind::Dropped
        )
    }
}

/// Errors surfaced by an `InstanceClient` implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudError {
    #[error("no image found for release '{release}'")]
    ImageNotFound { release: String },

    #[error("provider rejected instance creation: {0}")]
    Provisioning(String),

    /// The provider listing does not know the resource yet.
    #[error("resource not found yet: {0}")]
    NotFound(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("provider API call failed: {0}")]
    Api(String),
}

impl TransientError for CloudError {
    fn is_transient(&self) -> bool {
        match self {
            CloudError::NotFound(_) => true,
            CloudError::Connection(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// The readiness poller ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{what} not ready after {attempts} attempts ({waited:?} elapsed)")]
pub struct NotReadyError {
    pub what: String,
    pub attempts: u32,
    pub waited: Duration,
}

/// Raw capture could not be turned into a metric record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed systemd-analyze output: {0}")]
    MalformedTimingOutput(String),

    #[error("malformed fio output: {0}")]
    MalformedIoOutput(String),

    #[error("malformed netperf output: {0}")]
    MalformedThroughputOutput(String),

    #[error("malformed stress-ng output: {0}")]
    MalformedStressOutput(String),

    #[error("malformed lsblk output: {0}")]
    MalformedDeviceListing(String),

    #[error("invalid value for '{field}': {value} (must be finite and non-negative)")]
    InvalidMetric { field: &'static str, value: f64 },
}

/// Rejected run configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("iterations must be at least 1")]
    ZeroIterations,

    #[error("poll attempts must be at least 1")]
    ZeroPollAttempts,

    #[error("instance shape must not be empty")]
    EmptyShape,

    #[error("release must not be empty")]
    EmptyRelease,
}

/// Run-level error: everything that can abort a benchmark.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("no image found for release '{release}'")]
    ImageNotFound { release: String },

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error(transparent)]
    NotReady(#[from] NotReadyError),

    #[error(transparent)]
    Connection(ConnectionError),

    #[error(transparent)]
    Cloud(CloudError),

    #[error("no free NVMe disks on {instance}")]
    NoFreeDisks { instance: String },

    #[error("command '{command}' exited with status {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Stats(#[from] crate::stats::StatsError),

    #[error(transparent)]
    Report(#[from] crate::report::ReportError),

    #[error(transparent)]
    Series(#[from] crate::records::SeriesError),

    #[error("failed to persist results: {0}")]
    Persist(#[from] std::io::Error),

    #[error("run cancelled")]
    Cancelled,
}

impl From<CloudError> for BenchError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::ImageNotFound { release } => BenchError::ImageNotFound { release },
            CloudError::Provisioning(message) => BenchError::Provisioning(message),
            CloudError::Connection(err) => BenchError::Connection(err),
            other => BenchError::Cloud(other),
        }
    }
}

impl BenchError {
    /// Short, stable name of the error kind for user-facing diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            BenchError::ImageNotFound { .. } => "ImageNotFoundError",
            BenchError::Provisioning(_) => "ProvisioningError",
            BenchError::NotReady(_) => "NotReadyError",
            BenchError::Connection(_) => "ConnectionError",
            BenchError::Cloud(_) => "CloudError",
            BenchError::NoFreeDisks { .. } => "NoFreeDisksError",
            BenchError::Command { .. } => "CommandError",
            BenchError::Parse(ParseError::MalformedTimingOutput(_)) => "MalformedTimingOutput",
            BenchError::Parse(ParseError::MalformedIoOutput(_)) => "MalformedIoOutput",
            BenchError::Parse(ParseError::MalformedThroughputOutput(_)) => {
                "MalformedThroughputOutput"
            }
            BenchError::Parse(ParseError::MalformedStressOutput(_)) => "MalformedStressOutput",
            BenchError::Parse(ParseError::MalformedDeviceListing(_)) => "MalformedDeviceListing",
            BenchError::Parse(ParseError::InvalidMetric { .. }) => "InvalidMetric",
            BenchError::Stats(_) => "StatsError",
            BenchError::Report(_) => "ReportError",
            BenchError::Series(_) => "SeriesError",
            BenchError::Persist(_) => "PersistError",
            BenchError::Cancelled => "Cancelled",
        }
    }
}

/// Lifecycle stage a run was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Provisioning,
    Preparing,
    Executing { iteration: usize },
    Collecting { iteration: usize },
    Analyzing,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStage::Provisioning => write!(f, "provisioning"),
            RunStage::Preparing => write!(f, "workload preparation"),
            RunStage::Executing { iteration } => write!(f, "execution of iteration {}", iteration),
            RunStage::Collecting { iteration } => {
                write!(f, "collection of iteration {}", iteration)
            }
            RunStage::Analyzing => write!(f, "analysis"),
        }
    }
}

/// A failed benchmark run: which stage, and which error.
#[derive(Debug, thiserror::Error)]
#[error("benchmark failed during {stage} ({kind}): {source}", kind = .source.kind())]
pub struct RunError {
    pub stage: RunStage,
    #[source]
    pub source: BenchError,
}
