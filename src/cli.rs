use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Instance Bench - repeatable boot, storage, network and CPU benchmarks of cloud instances
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Also write logs to this file (plain text, no colors)
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision instances and run a benchmark
    Run(RunArgs),

    /// Re-parse raw captures persisted by earlier runs
    Parse(ParseArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct RunArgs {
    /// Benchmark to run
    #[clap(value_enum)]
    pub kind: BenchmarkKind,

    /// Instance type to benchmark (e.g. m5.large)
    pub instance_type: String,

    /// OS release codename used to pick the daily image
    #[clap(short = 'r', long, default_value = crate::defaults::RELEASE, help_heading = "Core Options")]
    pub release: String,

    /// Boot this image id instead of the latest daily image for the release
    #[clap(long, help_heading = "Core Options")]
    pub image: Option<String>,

    /// Number of iterations (defaults depend on the benchmark)
    #[clap(short = 'i', long, help_heading = "Core Options")]
    pub iterations: Option<usize>,

    /// Directory for raw captures and result files
    #[clap(long, default_value = crate::defaults::LOG_DIR, help_heading = "Output")]
    pub log_dir: PathBuf,

    /// Report format
    #[clap(long, value_enum, default_value_t = ReportFormat::Text, help_heading = "Output")]
    pub format: ReportFormat,

    /// Do not persist captures or results, only print the report
    #[clap(long, help_heading = "Output")]
    pub no_save: bool,

    /// Delay between readiness checks
    #[clap(long, value_parser = parse_duration, default_value = "10s", help_heading = "Readiness")]
    pub poll_interval: Duration,

    /// Readiness checks before giving up
    #[clap(long, default_value_t = crate::defaults::POLL_ATTEMPTS, help_heading = "Readiness")]
    pub poll_attempts: u32,

    /// Override the measured tool's run time (fio, netperf, stress)
    #[clap(long, value_parser = parse_duration, help_heading = "Workload")]
    pub runtime: Option<Duration>,

    /// Also measure random read and write (fio, fio-nvme)
    #[clap(long, help_heading = "Workload")]
    pub random: bool,

    /// Skip recording kernel and package versions with the results
    #[clap(long, help_heading = "Workload")]
    pub no_versions: bool,

    /// AWS region (defaults to the CLI's configured region)
    #[clap(long, help_heading = "AWS")]
    pub region: Option<String>,

    /// AWS CLI profile
    #[clap(long, help_heading = "AWS")]
    pub profile: Option<String>,

    /// EC2 key pair to launch with
    #[clap(long, help_heading = "AWS")]
    pub key_name: Option<String>,

    /// Login user on the instance
    #[clap(long, default_value = crate::defaults::SSH_USER, help_heading = "AWS")]
    pub ssh_user: String,

    /// Private key for ssh
    #[clap(long, help_heading = "AWS")]
    pub ssh_key: Option<PathBuf>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ParseArgs {
    /// Directory with persisted captures
    pub directory: PathBuf,
}

/// Available benchmarks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkKind {
    /// Initial boot and reboot times via systemd-analyze
    Boot,

    /// Sequential read and write throughput via fio
    Fio,

    /// fio against the local NVMe disks, striped when there are several
    #[serde(rename = "fio-nvme")]
    FioNvme,

    /// Single stream TCP and UDP performance via netperf
    Netperf,

    /// CPU matrix stressor via stress-ng
    Stress,
}

impl BenchmarkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BenchmarkKind::Boot => "boot",
            BenchmarkKind::Fio => "fio",
            BenchmarkKind::FioNvme => "fio-nvme",
            BenchmarkKind::Netperf => "netperf",
            BenchmarkKind::Stress => "stress",
        }
    }

    pub fn default_iterations(&self) -> usize {
        match self {
            BenchmarkKind::Boot => crate::defaults::BOOT_ITERATIONS,
            BenchmarkKind::Fio | BenchmarkKind::FioNvme => crate::defaults::FIO_ITERATIONS,
            BenchmarkKind::Netperf => crate::defaults::NETPERF_ITERATIONS,
            BenchmarkKind::Stress => crate::defaults::STRESS_ITERATIONS,
        }
    }
}

impl std::fmt::Display for BenchmarkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// CSV-compatible text
    #[default]
    Text,

    /// Structured JSON
    Json,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Text => "log",
            ReportFormat::Json => "json",
        }
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be non-negative: {}", s));
    }

    let duration = match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}
