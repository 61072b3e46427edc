//! # Instance Bench Library
//!
//! Repeatable performance benchmarks of remote cloud instances. A run
//! provisions instances of one shape and OS release, drives a measurement
//! workload on them for a number of iterations, turns the raw tool output of
//! every iteration into typed metric records, and aggregates those into a
//! report with mean, median and sample standard deviation per field.
//!
//! ## Supported Benchmarks
//!
//! - **boot**: initial boot and reboot times from `systemd-analyze`, on a fresh instance per iteration
//! - **fio**: sequential (and optionally random) read and write IOPS, bandwidth and disk utilization
//! - **fio-nvme**: the same against the instance's local NVMe disks, striped into RAID 0
//! - **netperf**: single stream TCP and UDP throughput and TCP request/response rate
//!   between two instances in one availability zone
//! - **stress**: bogo operations per second of the stress-ng matrix stressor
//!
//! ## Architecture Overview
//!
//! - `benchmark`: the run state machine and the instance session handed to workloads
//! - `cloud`: the `InstanceClient` seam and an implementation over the AWS CLI and ssh
//! - `poller`: bounded wait-until-ready used for every readiness wait
//! - `workloads`: what each benchmark installs, runs and captures
//! - `parsers`: raw tool output to `MetricRecord`
//! - `records`, `stats`, `report`: typed series, their summaries and the rendered report
//! - `results`: persistence of captures and reports, and re-parsing them later
//! - `versions`: kernel and package versions recorded alongside the results
//! - `cli`, `logging`, `error`: the outer surface
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use instance_bench::{
//!     cli::BenchmarkKind,
//!     cloud::{AwsCliClient, AwsCliConfig},
//!     workloads::{self, WorkloadOptions},
//!     BenchmarkRunner, BenchmarkSpec, RunnerConfig,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let spec = BenchmarkSpec::new(BenchmarkKind::Stress, "c5.large", "noble", 3)?;
//!     let client = Arc::new(AwsCliClient::new(AwsCliConfig::default()));
//!     let workload = workloads::for_kind(spec.kind, &WorkloadOptions::default());
//!
//!     let mut runner = BenchmarkRunner::new(client, workload, spec, RunnerConfig::default());
//!     let results = runner.run(None, &CancellationToken::new()).await?;
//!     print!("{}", results.rendered);
//!     Ok(())
//! }
//! ```

/// Run state machine and instance lifecycle
///
/// Sequences provisioning, per-iteration execution and collection, and the
/// final analysis. Owns the active instance and destroys it on every exit
/// path, including failure and cancellation.
pub mod benchmark;

/// Command-line interface and configuration
pub mod cli;

/// Cloud provider seam
///
/// The `InstanceClient` trait is the only way the engine talks to a
/// provider. Tests substitute an in-memory fake.
pub mod cloud;

pub mod error;

/// Colorized log formatting for the terminal
pub mod logging;

/// Raw capture parsers, one per measurement tool
pub mod parsers;

pub mod poller;

/// Typed metric records and per-series iteration logs
pub mod records;

pub mod report;

/// Persistence of raw captures and reports
pub mod results;

pub mod stats;

/// Software versions of the benchmarked image
pub mod versions;

/// Benchmark workloads
pub mod workloads;

pub use benchmark::{BenchmarkRunner, BenchmarkSpec, RunState, RunnerConfig};
pub use cli::{Args, BenchmarkKind, ReportFormat};
pub use cloud::{InstanceClient, InstanceHandle};
pub use error::{BenchError, RunError};
pub use records::{IterationSeries, MetricRecord};
pub use report::Report;
pub use results::{BenchmarkResults, ResultsManager};

/// The current version of instance-bench
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Delay between two readiness checks
    pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

    /// Readiness checks before giving up, two minutes at the default interval
    pub const POLL_ATTEMPTS: u32 = 12;

    /// OS release codename whose daily image is booted
    pub const RELEASE: &str = "noble";

    pub const LOG_DIR: &str = "logs";

    pub const SSH_USER: &str = "ubuntu";

    /// `Name` tag of every created instance
    pub const INSTANCE_NAME: &str = "instance-bench";

    pub const BOOT_ITERATIONS: usize = 10;
    pub const FIO_ITERATIONS: usize = 5;
    pub const NETPERF_ITERATIONS: usize = 4;
    pub const STRESS_ITERATIONS: usize = 5;

    pub const FIO_RUNTIME: Duration = Duration::from_secs(600);
    pub const NETPERF_RUNTIME: Duration = Duration::from_secs(600);
    pub const STRESS_RUNTIME: Duration = Duration::from_secs(60);
}
