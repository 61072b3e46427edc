//! In-memory `InstanceClient` for driving full benchmark runs in tests.
//!
//! Instances live in a map behind a mutex. Command output is canned per
//! command (a leading `sudo` is ignored), boot ids change on restart, and
//! faults can be injected at every stage of the lifecycle. Every create,
//! destroy and remote command is logged so tests can assert on cleanup.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, Once};
use std::time::Duration;

use instance_bench::cloud::{
    CommandOutput, InstanceClient, InstanceHandle, InstanceState, LaunchRequest, Tag,
};
use instance_bench::error::{CloudError, ConnectionError, ConnectionErrorKind};
use instance_bench::poller::PollConfig;
use instance_bench::RunnerConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(filter)
            .try_init();
    });
}

/// Short poll budget so exhausted waits finish in milliseconds.
pub fn fast_config() -> RunnerConfig {
    RunnerConfig {
        poll: PollConfig::new(Duration::from_millis(1), 6),
        ..RunnerConfig::default()
    }
}

pub const IMAGE_ID: &str = "ami-0daily";

pub const INITIAL_BOOT: &str = "Startup finished in 3.802s (firmware) + 4.318s (loader) + 5.291s (kernel) + 2min 2.026s (userspace) = 2min 15.437s\n\
graphical.target reached after 2min 1.931s in userspace.\n";

pub const REBOOT: &str = "Startup finished in 1.500s (firmware) + 2.000s (loader) + 3.000s (kernel) + 10.000s (userspace) = 16.500s\n\
graphical.target reached after 9.950s in userspace.\n";

pub const NOT_FINISHED: &str = "System is booting up. Unit cloud-final.service is still in progress.\n";

/// Zone every fake instance is placed in unless the request names one.
pub const ZONE: &str = "us-east-1a";

pub const KERNEL: &str = "6.8.0-1012-aws";

/// Installed versions answered by `dpkg-query`; anything else is not installed.
pub const PACKAGE_VERSIONS: [(&str, &str); 6] = [
    ("systemd", "255.4-1ubuntu8"),
    ("cloud-init", "24.1.3-0ubuntu3"),
    ("fio", "3.36-1"),
    ("netperf", "2.7.0-0.1"),
    ("stress-ng", "0.17.06-1build1"),
    ("mdadm", "4.3-1ubuntu2"),
];

/// `lsblk --json` with a partitioned root disk and `free` unused NVMe disks.
pub fn lsblk_output(free: usize) -> String {
    let mut devices = vec![r#"{"name": "nvme0n1", "type": "disk", "size": "8G",
        "children": [{"name": "nvme0n1p1", "type": "part", "mountpoints": ["/"]}]}"#
        .to_string()];
    for n in 1..=free {
        devices.push(format!(
            r#"{{"name": "nvme{}n1", "type": "disk", "size": "442.4G", "mountpoints": [null]}}"#,
            n
        ));
    }
    format!("{{\"blockdevices\": [{}]}}\n", devices.join(",\n"))
}

/// fio JSON for one operation; read-side operations report read IOPS.
pub fn fio_output(operation: &str) -> String {
    let (read_iops, write_iops) = if operation.contains("read") {
        (3000.0, 0.0)
    } else {
        (0.0, 1500.0)
    };
    format!(
        r#"{{
  "fio version": "fio-3.36",
  "jobs": [
    {{
      "jobname": "{op}",
      "read": {{"io_bytes": 12582912000, "bw": 12000, "iops": {read_iops}}},
      "write": {{"io_bytes": 6291456000, "bw": 6000, "iops": {write_iops}}}
    }}
  ],
  "disk_util": [{{"name": "nvme0n1", "util": 97.5}}]
}}"#,
        op = operation,
        read_iops = read_iops,
        write_iops = write_iops,
    )
}

pub const TCP_STREAM: &str = "\
MIGRATED TCP STREAM TEST from 0.0.0.0 (0.0.0.0) port 0 AF_INET to 172.31.0.2 () port 0 AF_INET
Recv   Send    Send
Socket Socket  Message  Elapsed
Size   Size    Size     Time     Throughput
bytes  bytes   bytes    secs.    10^6bits/sec

131072  16384  16384    10.00     937.45
";

pub const TCP_MAERTS: &str = "\
MIGRATED TCP MAERTS TEST from 0.0.0.0 (0.0.0.0) port 0 AF_INET to 172.31.0.2 () port 0 AF_INET
Recv   Send    Send
Socket Socket  Message  Elapsed
Size   Size    Size     Time     Throughput
bytes  bytes   bytes    secs.    10^6bits/sec

131072  16384  16384    10.00     811.20
";

pub const UDP_STREAM: &str = "\
MIGRATED UDP STREAM TEST from 0.0.0.0 (0.0.0.0) port 0 AF_INET to 172.31.0.2 () port 0 AF_INET
Socket  Message  Elapsed      Messages
Size    Size     Time         Okay Errors   Throughput
bytes   bytes    secs            #      #   10^6bits/sec

212992   65507   10.00      175799      0    9212.76
212992           10.00      175797           9212.66

";

pub const TCP_RR: &str = "\
MIGRATED TCP REQUEST/RESPONSE TEST from 0.0.0.0 (0.0.0.0) port 0 AF_INET to 172.31.0.2 () port 0 AF_INET : first burst 0
Local /Remote
Socket Size   Request  Resp.   Elapsed  Trans.
Send   Recv   Size     Size    Time     Rate
bytes  Bytes  bytes    bytes   secs.    per sec

16384  131072 1        1       10.00    35934.62
16384  131072
";

pub const STRESS: &str = "\
stress-ng: info:  [2841] setting to a 60 second run per stressor
stress-ng: info:  [2841] dispatching hogs: 4 matrix
stress-ng: info:  [2841] stressor       bogo ops real time  usr time  sys time   bogo ops/s     bogo ops/s
stress-ng: info:  [2841]                           (secs)    (secs)    (secs)   (real time) (usr+sys time)
stress-ng: info:  [2841] matrix            36276     60.00    239.73      0.02       604.59       151.31
stress-ng: info:  [2841] successful run completed in 60.01s (1 min, 0.01 secs)
";

/// Something to go wrong.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// No image for the release
    ResolveImage,
    /// The nth create call (1-based) is rejected
    Create(usize),
    /// Instances never leave `pending`
    StuckPending,
    /// Instances report this state instead of `running`
    EntersState(&'static str),
    /// The command channel always refuses
    Unreachable,
    /// Commands starting with the prefix exit 1
    CommandFails(&'static str),
    /// Commands starting with the prefix print junk and exit 0
    Garbage(&'static str),
    /// Commands starting with the prefix never return
    Hang(&'static str),
    Restart,
    Destroy,
}

#[derive(Default)]
struct Instance {
    image_id: String,
    /// 1-based creation order, also the last octet of the private address
    index: usize,
    state_checks: u32,
    boot: u32,
    /// Boot id reads that still see the previous boot
    stale_boot_reads: u32,
    analyze_calls: u32,
    last_fio: Option<String>,
}

#[derive(Default)]
struct World {
    next_id: usize,
    instances: HashMap<String, Instance>,
    created: Vec<String>,
    destroyed: Vec<String>,
    tags: Vec<Vec<Tag>>,
    /// Requested zone of every accepted create
    zones: Vec<Option<String>>,
    commands: Vec<(String, String)>,
    resolve_calls: usize,
}

enum Reply {
    Output(CommandOutput),
    Hang,
}

pub struct FakeCloud {
    faults: Vec<Fault>,
    not_found_checks: u32,
    pending_checks: u32,
    unfinished_analyze_calls: u32,
    nvme_disks: usize,
    create_delay: Option<Duration>,
    world: Mutex<World>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            faults: Vec::new(),
            not_found_checks: 1,
            pending_checks: 2,
            unfinished_analyze_calls: 1,
            nvme_disks: 0,
            create_delay: None,
            world: Mutex::new(World::default()),
        }
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    /// State checks answered with "not found" after creation.
    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    /// State checks answered with `pending` after creation and restart.
    pub fn with_pending_checks(mut self, checks: u32) -> Self {
        self.pending_checks = checks;
        self
    }

    /// Unused NVMe disks listed next to the root disk.
    pub fn with_nvme_disks(mut self, disks: usize) -> Self {
        self.nvme_disks = disks;
        self
    }

    /// `create` registers the instance at once but returns only after `delay`.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn created(&self) -> Vec<String> {
        self.world.lock().unwrap().created.clone()
    }

    /// Destroy attempts, including failed ones.
    pub fn destroyed(&self) -> Vec<String> {
        self.world.lock().unwrap().destroyed.clone()
    }

    pub fn live(&self) -> Vec<String> {
        let world = self.world.lock().unwrap();
        let mut live: Vec<_> = world.instances.keys().cloned().collect();
        live.sort();
        live
    }

    pub fn tags(&self) -> Vec<Vec<Tag>> {
        self.world.lock().unwrap().tags.clone()
    }

    pub fn image_of(&self, id: &str) -> Option<String> {
        let world = self.world.lock().unwrap();
        world.instances.get(id).map(|i| i.image_id.clone())
    }

    pub fn launch_zones(&self) -> Vec<Option<String>> {
        self.world.lock().unwrap().zones.clone()
    }

    pub fn resolve_calls(&self) -> usize {
        self.world.lock().unwrap().resolve_calls
    }

    /// Commands run on any instance, in order.
    pub fn commands(&self) -> Vec<String> {
        let world = self.world.lock().unwrap();
        world.commands.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Commands run on one instance, in order.
    pub fn commands_on(&self, id: &str) -> Vec<String> {
        let world = self.world.lock().unwrap();
        world
            .commands
            .iter()
            .filter(|(on, _)| on == id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn commands_matching(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn has(&self, fault: &Fault) -> bool {
        self.faults.contains(fault)
    }

    fn prefix_fault(&self, command: &str) -> Option<&Fault> {
        self.faults.iter().find(|fault| match fault {
            Fault::CommandFails(prefix) | Fault::Garbage(prefix) | Fault::Hang(prefix) => {
                command.starts_with(prefix)
            }
            _ => false,
        })
    }

    fn reply(&self, id: &str, command: &str) -> Reply {
        match self.prefix_fault(command) {
            Some(Fault::Hang(_)) => return Reply::Hang,
            Some(Fault::CommandFails(_)) => return Reply::Output(failed("boom")),
            Some(Fault::Garbage(_)) => return Reply::Output(ok("garbage\n")),
            _ => {}
        }

        let mut world = self.world.lock().unwrap();
        world.commands.push((id.to_string(), command.to_string()));
        let Some(instance) = world.instances.get_mut(id) else {
            return Reply::Output(failed("no such instance"));
        };

        let command = command.strip_prefix("sudo ").unwrap_or(command);
        let output = if command == "cat /proc/sys/kernel/random/boot_id" {
            let boot = if instance.stale_boot_reads > 0 {
                instance.stale_boot_reads -= 1;
                instance.boot.saturating_sub(1)
            } else {
                instance.boot
            };
            ok(&format!("{}-boot-{}\n", id, boot))
        } else if command == "systemd-analyze" {
            instance.analyze_calls += 1;
            if instance.analyze_calls <= self.unfinished_analyze_calls {
                CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: NOT_FINISHED.to_string(),
                }
            } else if instance.boot == 0 {
                ok(INITIAL_BOOT)
            } else {
                ok(REBOOT)
            }
        } else if let Some(rest) = command.strip_prefix("fio --name=") {
            instance.last_fio = rest.split_whitespace().next().map(str::to_string);
            ok("")
        } else if command == "cat fio.json" {
            match &instance.last_fio {
                Some(op) => ok(&fio_output(op)),
                None => failed("cat: fio.json: No such file or directory"),
            }
        } else if command == "rm -f fio.json" {
            instance.last_fio = None;
            ok("")
        } else if let Some(rest) = command.strip_prefix("netperf -t ") {
            match rest.split_whitespace().next() {
                Some("TCP_STREAM") => ok(TCP_STREAM),
                Some("TCP_MAERTS") => ok(TCP_MAERTS),
                Some("UDP_STREAM") => ok(UDP_STREAM),
                Some("TCP_RR") => ok(TCP_RR),
                _ => failed("netperf: invalid test"),
            }
        } else if command.starts_with("stress-ng ") {
            ok(STRESS)
        } else if command == "hostname -I" {
            ok(&format!("172.31.0.{} fe80::8ff:feff:fe00:{}\n", instance.index, instance.index))
        } else if command == "grep -c processor /proc/cpuinfo" {
            ok("2\n")
        } else if command == "lsblk --json" {
            ok(&lsblk_output(self.nvme_disks))
        } else if command == "uname --kernel-release" {
            ok(&format!("{}\n", KERNEL))
        } else if command.starts_with("dpkg-query ") {
            let package = command.split_whitespace().last().unwrap_or_default();
            match PACKAGE_VERSIONS.iter().find(|(name, _)| *name == package) {
                Some((_, version)) => ok(version),
                None => failed(&format!(
                    "dpkg-query: no packages found matching {}",
                    package
                )),
            }
        } else {
            ok("")
        };
        Reply::Output(output)
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl InstanceClient for FakeCloud {
    async fn resolve_image(&self, release: &str) -> Result<String, CloudError> {
        self.world.lock().unwrap().resolve_calls += 1;
        if self.has(&Fault::ResolveImage) {
            return Err(CloudError::ImageNotFound {
                release: release.to_string(),
            });
        }
        Ok(IMAGE_ID.to_string())
    }

    async fn create(&self, request: &LaunchRequest) -> Result<InstanceHandle, CloudError> {
        let id = {
            let mut world = self.world.lock().unwrap();
            world.next_id += 1;
            let index = world.next_id;
            if self.has(&Fault::Create(index)) {
                return Err(CloudError::Provisioning(
                    "InsufficientInstanceCapacity".to_string(),
                ));
            }

            let id = format!("i-{:04}", index);
            world.instances.insert(
                id.clone(),
                Instance {
                    image_id: request.image_id.clone(),
                    index,
                    ..Instance::default()
                },
            );
            world.created.push(id.clone());
            world.tags.push(request.tags.clone());
            world.zones.push(request.zone.clone());
            id
        };

        // The provider already knows the instance while the response is in flight.
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(InstanceHandle::new(id))
    }

    async fn state(&self, handle: &InstanceHandle) -> Result<InstanceState, CloudError> {
        let mut world = self.world.lock().unwrap();
        let Some(instance) = world.instances.get_mut(handle.id()) else {
            return Err(CloudError::NotFound(handle.id().to_string()));
        };
        instance.state_checks += 1;
        let checks = instance.state_checks;

        if checks <= self.not_found_checks {
            return Err(CloudError::NotFound(handle.id().to_string()));
        }
        if self.has(&Fault::StuckPending) || checks <= self.not_found_checks + self.pending_checks
        {
            return Ok(InstanceState::Pending);
        }
        for fault in &self.faults {
            if let Fault::EntersState(state) = fault {
                return Ok(InstanceState::from_name(state));
            }
        }
        Ok(InstanceState::Running)
    }

    async fn restart(&self, handle: &InstanceHandle) -> Result<(), CloudError> {
        if self.has(&Fault::Restart) {
            return Err(CloudError::Api("IncorrectState".to_string()));
        }
        let mut world = self.world.lock().unwrap();
        let Some(instance) = world.instances.get_mut(handle.id()) else {
            return Err(CloudError::NotFound(handle.id().to_string()));
        };
        instance.boot += 1;
        instance.stale_boot_reads = 1;
        instance.analyze_calls = 0;
        // Listing already knows the instance; only the pending phase repeats.
        instance.state_checks = self.not_found_checks;
        Ok(())
    }

    async fn run(
        &self,
        handle: &InstanceHandle,
        command: &str,
    ) -> Result<CommandOutput, CloudError> {
        if self.has(&Fault::Unreachable) {
            return Err(ConnectionError::new(
                ConnectionErrorKind::Refused,
                "ssh: connect to host port 22: Connection refused",
            )
            .into());
        }
        match self.reply(handle.id(), command) {
            Reply::Output(output) => Ok(output),
            Reply::Hang => {
                std::future::pending::<()>().await;
                Err(CloudError::Api("unreachable".to_string()))
            }
        }
    }

    async fn public_address(
        &self,
        handle: &InstanceHandle,
    ) -> Result<Option<String>, CloudError> {
        let world = self.world.lock().unwrap();
        Ok(world
            .instances
            .get(handle.id())
            .map(|_| "203.0.113.10".to_string()))
    }

    async fn zone(&self, handle: &InstanceHandle) -> Result<Option<String>, CloudError> {
        let world = self.world.lock().unwrap();
        Ok(world.instances.get(handle.id()).map(|_| ZONE.to_string()))
    }

    async fn destroy(&self, handle: InstanceHandle) -> Result<(), CloudError> {
        let mut world = self.world.lock().unwrap();
        world.destroyed.push(handle.id().to_string());
        if self.has(&Fault::Destroy) {
            return Err(CloudError::Api("UnauthorizedOperation".to_string()));
        }
        world.instances.remove(handle.id());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
