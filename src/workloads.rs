//! # Workloads
//!
//! One `Workload` per benchmark kind. A workload knows how to prepare an
//! instance, what to run for one iteration, which series its captures feed,
//! whether it needs a brand new instance for every iteration, and whether it
//! needs a second instance to talk to. The runner drives the lifecycle;
//! workloads never create or destroy instances.
//!
//! Workloads never sleep. Anything that has to wait for the instance goes
//! through the readiness poller via `InstanceSession`.

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::benchmark::InstanceSession;
use crate::cloud::CommandOutput;
use crate::cli::BenchmarkKind;
use crate::error::BenchError;
use crate::parsers::{lsblk, CaptureKind, RawCapture};
use crate::records::{IoOperation, MetricKind, NetperfTest};
use crate::report::ReportHeader;

#[async_trait]
pub trait Workload: Send + Sync {
    fn kind(&self) -> BenchmarkKind;

    fn header(&self) -> ReportHeader;

    /// Series names and record kinds, in report order.
    fn series(&self) -> Vec<(String, MetricKind)>;

    fn fresh_instance_per_iteration(&self) -> bool {
        false
    }

    /// Launch a server instance in the primary's availability zone, reachable
    /// through `InstanceSession::peer`.
    fn needs_server(&self) -> bool {
        false
    }

    /// Runs once per instance lifetime, before the first iteration on it.
    async fn prepare(&mut self, _session: &InstanceSession<'_>) -> Result<(), BenchError> {
        Ok(())
    }

    /// Execute one iteration and return its raw captures.
    async fn run_iteration(
        &self,
        session: &InstanceSession<'_>,
        iteration: usize,
    ) -> Result<Vec<RawCapture>, BenchError>;
}

/// Knobs shared by the workload constructors.
#[derive(Debug, Clone, Default)]
pub struct WorkloadOptions {
    /// Overrides each tool's default run time
    pub runtime: Option<Duration>,
    /// Add random read and write to the fio operations
    pub random_io: bool,
}

/// Build the workload for a benchmark kind.
pub fn for_kind(kind: BenchmarkKind, options: &WorkloadOptions) -> Box<dyn Workload> {
    match kind {
        BenchmarkKind::Boot => Box::new(BootWorkload),
        BenchmarkKind::Fio => Box::new(FioWorkload::boot_disk(options)),
        BenchmarkKind::FioNvme => Box::new(FioWorkload::nvme(options)),
        BenchmarkKind::Netperf => Box::new(NetperfWorkload {
            runtime: options.runtime.unwrap_or(crate::defaults::NETPERF_RUNTIME),
        }),
        BenchmarkKind::Stress => Box::new(StressWorkload {
            runtime: options.runtime.unwrap_or(crate::defaults::STRESS_RUNTIME),
        }),
    }
}

async fn install_packages(session: &InstanceSession<'_>, packages: &str) -> Result<(), BenchError> {
    info!("Installing {}", packages);
    session.run_checked("sudo apt-get update").await?;
    session
        .run_checked(&format!("sudo apt-get install --yes {}", packages))
        .await?;
    Ok(())
}

/// Whole seconds, at least one.
fn seconds(duration: Duration) -> u64 {
    duration.as_secs().max(1)
}

/// Initial boot and reboot times as reported by `systemd-analyze`.
pub struct BootWorkload;

const INITIAL_BOOT: &str = "Initial Boot";
const REBOOT: &str = "Reboot";

#[async_trait]
impl Workload for BootWorkload {
    fn kind(&self) -> BenchmarkKind {
        BenchmarkKind::Boot
    }

    fn header(&self) -> ReportHeader {
        ReportHeader::new(
            "Initial boot and reboot systemd-analyze times",
            "systemd-analyze time",
        )
    }

    fn series(&self) -> Vec<(String, MetricKind)> {
        vec![
            (INITIAL_BOOT.to_string(), MetricKind::Boot),
            (REBOOT.to_string(), MetricKind::Boot),
        ]
    }

    fn fresh_instance_per_iteration(&self) -> bool {
        true
    }

    async fn run_iteration(
        &self,
        session: &InstanceSession<'_>,
        iteration: usize,
    ) -> Result<Vec<RawCapture>, BenchError> {
        // systemd-analyze exits non-zero until the boot transaction finishes.
        let initial = session
            .wait_for_success("boot finished", "systemd-analyze")
            .await?;

        session.restart_and_wait().await?;
        let reboot = session
            .wait_for_success("reboot finished", "systemd-analyze")
            .await?;

        Ok(vec![
            RawCapture::new(
                CaptureKind::BootTiming,
                INITIAL_BOOT,
                iteration,
                "initial",
                initial.stdout,
            ),
            RawCapture::new(
                CaptureKind::BootTiming,
                REBOOT,
                iteration,
                "reboot",
                reboot.stdout,
            ),
        ])
    }
}

/// Where fio does its I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FioTarget {
    /// A 1G scratch file in the login user's home on the boot disk
    BootDisk,
    /// The local NVMe disks; the device is found while preparing
    Nvme { device: Option<String> },
}

/// Read then write throughput with fio, optionally followed by random read
/// and random write.
pub struct FioWorkload {
    target: FioTarget,
    operations: Vec<IoOperation>,
    runtime: Duration,
}

const RAID_DEVICE: &str = "/dev/md0";

impl FioWorkload {
    pub fn boot_disk(options: &WorkloadOptions) -> Self {
        Self::new(FioTarget::BootDisk, options)
    }

    pub fn nvme(options: &WorkloadOptions) -> Self {
        Self::new(FioTarget::Nvme { device: None }, options)
    }

    fn new(target: FioTarget, options: &WorkloadOptions) -> Self {
        let mut operations = IoOperation::SEQUENTIAL.to_vec();
        if options.random_io {
            operations.extend(IoOperation::RANDOM);
        }
        Self {
            target,
            operations,
            runtime: options.runtime.unwrap_or(crate::defaults::FIO_RUNTIME),
        }
    }

    fn command(&self, operation: IoOperation) -> Result<String, BenchError> {
        let common = format!(
            "--direct=1 --ioengine=libaio --iodepth=32 \
             --time_based --ramp_time=60 --runtime={runtime} \
             --group_reporting=1 --output-format=json --output=fio.json",
            runtime = seconds(self.runtime),
        );
        match &self.target {
            FioTarget::BootDisk => Ok(format!(
                "fio --name={op} --readwrite={op} --size=1G --numjobs=4 {common}",
                op = operation,
            )),
            FioTarget::Nvme { device: Some(device) } => Ok(format!(
                "sudo fio --name={op} --readwrite={op} --filename={device} --numjobs=32 {common}",
                op = operation,
            )),
            FioTarget::Nvme { device: None } => Err(BenchError::Provisioning(
                "fio device not prepared".to_string(),
            )),
        }
    }

    /// Raw devices are only writable as root, and so is fio's output then.
    fn privileged(&self, command: &str) -> String {
        match self.target {
            FioTarget::BootDisk => command.to_string(),
            FioTarget::Nvme { .. } => format!("sudo {}", command),
        }
    }

    /// The single free disk, or a RAID 0 array striped over all of them.
    async fn prepare_nvme(session: &InstanceSession<'_>) -> Result<String, BenchError> {
        let listing = session.run_checked("lsblk --json").await?;
        let disks = lsblk::free_nvme_disks(&listing.stdout)?;
        match disks.as_slice() {
            [] => Err(BenchError::NoFreeDisks {
                instance: session.handle().id().to_string(),
            }),
            [disk] => {
                info!("Testing single NVMe disk {}", disk);
                Ok(disk.clone())
            }
            _ => {
                info!("Striping {} NVMe disks into {}", disks.len(), RAID_DEVICE);
                session
                    .run_checked(&format!(
                        "sudo mdadm --create {} --level=0 --name=TEST_RAID --raid-devices={} {}",
                        RAID_DEVICE,
                        disks.len(),
                        disks.join(" ")
                    ))
                    .await?;
                Ok(RAID_DEVICE.to_string())
            }
        }
    }
}

fn io_series(operation: IoOperation) -> &'static str {
    match operation {
        IoOperation::Read => "Read",
        IoOperation::Write => "Write",
        IoOperation::RandRead => "Random Read",
        IoOperation::RandWrite => "Random Write",
    }
}

#[async_trait]
impl Workload for FioWorkload {
    fn kind(&self) -> BenchmarkKind {
        match self.target {
            FioTarget::BootDisk => BenchmarkKind::Fio,
            FioTarget::Nvme { .. } => BenchmarkKind::FioNvme,
        }
    }

    fn header(&self) -> ReportHeader {
        let description = if self.operations.iter().any(IoOperation::is_random) {
            "Peak 4K IOPS performance of sequential and random read and write"
        } else {
            "Peak 4K IOPS performance of sequential read and write"
        };
        ReportHeader::new(description, "fio")
    }

    fn series(&self) -> Vec<(String, MetricKind)> {
        self.operations
            .iter()
            .map(|op| (io_series(*op).to_string(), MetricKind::Io))
            .collect()
    }

    async fn prepare(&mut self, session: &InstanceSession<'_>) -> Result<(), BenchError> {
        match &mut self.target {
            FioTarget::BootDisk => install_packages(session, "fio").await,
            FioTarget::Nvme { device } => {
                install_packages(session, "fio mdadm").await?;
                *device = Some(Self::prepare_nvme(session).await?);
                Ok(())
            }
        }
    }

    async fn run_iteration(
        &self,
        session: &InstanceSession<'_>,
        iteration: usize,
    ) -> Result<Vec<RawCapture>, BenchError> {
        let mut captures = Vec::new();
        for operation in self.operations.iter().copied() {
            info!("Running fio {}", operation);
            session.run_checked(&self.command(operation)?).await?;
            let output = session.run_checked(&self.privileged("cat fio.json")).await?;
            session.run_checked(&self.privileged("rm -f fio.json")).await?;
            captures.push(RawCapture::new(
                CaptureKind::IoJson(operation),
                io_series(operation),
                iteration,
                operation.as_str(),
                output.stdout,
            ));
        }
        Ok(captures)
    }
}

/// Single stream TCP and UDP throughput plus TCP request/response rate,
/// measured from the primary against a server in the same zone.
pub struct NetperfWorkload {
    runtime: Duration,
}

const NETPERF_TESTS: [(NetperfTest, &str); 4] = [
    (NetperfTest::TcpStream, "TCP send"),
    (NetperfTest::UdpStream, "UDP send"),
    (NetperfTest::TcpMaerts, "TCP receive"),
    (NetperfTest::TcpRr, "TCP request/response"),
];

fn missing_server() -> BenchError {
    BenchError::Provisioning("netperf needs a server instance".to_string())
}

/// First word of `output`, for commands that print a list.
fn first_token(command: &str, output: &CommandOutput) -> Result<String, BenchError> {
    output
        .stdout
        .split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| BenchError::Command {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: "no output".to_string(),
        })
}

impl NetperfWorkload {
    fn command(&self, test: NetperfTest, server: &str, cpus: &str) -> String {
        format!(
            "sudo netperf -t {} -H {} -l {} -c -C -n {}",
            test,
            server,
            seconds(self.runtime),
            cpus
        )
    }
}

#[async_trait]
impl Workload for NetperfWorkload {
    fn kind(&self) -> BenchmarkKind {
        BenchmarkKind::Netperf
    }

    fn header(&self) -> ReportHeader {
        ReportHeader::new("Single stream TCP and UDP performance", "netperf")
    }

    fn series(&self) -> Vec<(String, MetricKind)> {
        NETPERF_TESTS
            .iter()
            .map(|(_, series)| (series.to_string(), MetricKind::Network))
            .collect()
    }

    fn needs_server(&self) -> bool {
        true
    }

    async fn prepare(&mut self, session: &InstanceSession<'_>) -> Result<(), BenchError> {
        let server = session.peer().ok_or_else(missing_server)?;
        install_packages(session, "netperf").await?;
        install_packages(&server, "netperf").await?;
        // Already running when the package's service started it.
        server.run("sudo netserver").await?;
        Ok(())
    }

    async fn run_iteration(
        &self,
        session: &InstanceSession<'_>,
        iteration: usize,
    ) -> Result<Vec<RawCapture>, BenchError> {
        let server = session.peer().ok_or_else(missing_server)?;
        let addresses = server.run_checked(ADDRESS_COMMAND).await?;
        let address = first_token(ADDRESS_COMMAND, &addresses)?;
        let processors = session.run_checked(CPU_COUNT_COMMAND).await?;
        let cpus = first_token(CPU_COUNT_COMMAND, &processors)?;
        info!(server = %address, cpus = %cpus, "Measuring against server");

        let mut captures = Vec::new();
        for (test, series) in NETPERF_TESTS {
            info!("Running netperf {}", test);
            let output = session
                .run_checked(&self.command(test, &address, &cpus))
                .await?;
            captures.push(RawCapture::new(
                CaptureKind::Throughput(test),
                series,
                iteration,
                test.as_str(),
                output.stdout,
            ));
        }
        Ok(captures)
    }
}

/// Private addresses of the server; in-zone traffic uses the first
const ADDRESS_COMMAND: &str = "hostname -I";
const CPU_COUNT_COMMAND: &str = "grep -c processor /proc/cpuinfo";

/// CPU throughput of the stress-ng matrix stressor on all cores.
pub struct StressWorkload {
    runtime: Duration,
}

#[async_trait]
impl Workload for StressWorkload {
    fn kind(&self) -> BenchmarkKind {
        BenchmarkKind::Stress
    }

    fn header(&self) -> ReportHeader {
        ReportHeader::new("Matrix stressor bogo operations", "stress-ng --matrix 0")
    }

    fn series(&self) -> Vec<(String, MetricKind)> {
        vec![("Matrix".to_string(), MetricKind::Stress)]
    }

    async fn prepare(&mut self, session: &InstanceSession<'_>) -> Result<(), BenchError> {
        install_packages(session, "stress-ng").await
    }

    async fn run_iteration(
        &self,
        session: &InstanceSession<'_>,
        iteration: usize,
    ) -> Result<Vec<RawCapture>, BenchError> {
        // Metrics are logged on stderr.
        let command = format!(
            "stress-ng --matrix 0 --timeout {}s --metrics-brief 2>&1",
            seconds(self.runtime)
        );
        let output = session.run_checked(&command).await?;
        Ok(vec![RawCapture::new(
            CaptureKind::StressText,
            "Matrix",
            iteration,
            "matrix",
            output.stdout,
        )])
    }
}
