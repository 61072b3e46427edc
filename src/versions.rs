//! Kernel and package versions of the benchmarked image.
//!
//! Recorded once per run, right after the first instance is prepared, so a
//! report can be traced back to the software that produced it. Only
//! installed versions are read; nothing here talks to a package mirror.

use serde::Serialize;
use tracing::{info, warn};

use crate::benchmark::InstanceSession;
use crate::error::BenchError;

/// Packages whose installed version is recorded.
pub const PACKAGES: [&str; 7] = [
    "systemd",
    "cloud-init",
    "fio",
    "netperf",
    "stress-ng",
    "mdadm",
    "landscape-client",
];

const KERNEL_COMMAND: &str = "uname --kernel-release";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageVersion {
    pub name: String,
    /// `None` when the package is not installed
    pub version: Option<String>,
}

/// Software versions of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub instance: String,
    pub kernel: Option<String>,
    pub packages: Vec<PackageVersion>,
}

impl SystemInfo {
    pub fn package(&self, name: &str) -> Option<&PackageVersion> {
        self.packages.iter().find(|p| p.name == name)
    }
}

fn version_command(package: &str) -> String {
    format!("dpkg-query --showformat='${{Version}}' --show {}", package)
}

/// Trimmed stdout on success; a failing command is logged and yields `None`.
async fn query(session: &InstanceSession<'_>, command: &str) -> Result<Option<String>, BenchError> {
    let output = session.run(command).await?;
    if !output.success() {
        warn!(
            command,
            exit_code = output.exit_code,
            "Version query failed: {}",
            output.stderr.trim()
        );
        return Ok(None);
    }
    let value = output.stdout.trim();
    Ok((!value.is_empty()).then(|| value.to_string()))
}

/// Read the kernel release and the installed version of every package.
pub async fn collect(session: &InstanceSession<'_>) -> Result<SystemInfo, BenchError> {
    let kernel = query(session, KERNEL_COMMAND).await?;
    let mut packages = Vec::with_capacity(PACKAGES.len());
    for name in PACKAGES {
        let version = query(session, &version_command(name)).await?;
        packages.push(PackageVersion {
            name: name.to_string(),
            version,
        });
    }

    let installed = packages.iter().filter(|p| p.version.is_some()).count();
    info!(
        kernel = kernel.as_deref().unwrap_or("unknown"),
        "Recorded versions of {} of {} packages",
        installed,
        packages.len()
    );
    Ok(SystemInfo {
        instance: session.handle().id().to_string(),
        kernel,
        packages,
    })
}
