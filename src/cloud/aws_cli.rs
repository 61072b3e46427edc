//! EC2 backend driven through the `aws` CLI and `ssh` binaries.
//!
//! Each capability shells out once and decodes the JSON answer. Remote
//! commands go over `ssh` in batch mode with `LogLevel=ERROR`, so ssh only
//! writes its own fatal diagnostics to stderr.
//!
//! Exit status 255 is ssh's failure code, but a remote command may exit 255
//! too. It is only treated as a connection failure when the last stderr line
//! is one of ssh's diagnostics; that line is then classified so the
//! readiness poller can tell a booting or rebooting instance from a broken
//! key. A remote command that exits 255 and happens to end its stderr with
//! such a line is still reported as a connection failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    release_image_pattern, select_latest_image, CommandOutput, ImageRecord, InstanceClient,
    InstanceHandle, InstanceState, LaunchRequest, Tag,
};
use crate::error::{CloudError, ConnectionError, ConnectionErrorKind};

/// Exit status ssh uses for its own (connection-level) failures.
const SSH_FAILURE_STATUS: i32 = 255;

/// Settings for the AWS CLI backend.
#[derive(Debug, Clone)]
pub struct AwsCliConfig {
    pub region: Option<String>,
    pub profile: Option<String>,
    /// EC2 key pair name injected at launch
    pub key_name: Option<String>,
    pub ssh_user: String,
    /// Private key passed to `ssh -i`
    pub ssh_key: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

impl Default for AwsCliConfig {
    fn default() -> Self {
        Self {
            region: None,
            profile: None,
            key_name: None,
            ssh_user: crate::defaults::SSH_USER.to_string(),
            ssh_key: None,
            connect_timeout_secs: 10,
        }
    }
}

pub struct AwsCliClient {
    config: AwsCliConfig,
}

impl AwsCliClient {
    pub fn new(config: AwsCliConfig) -> Self {
        Self { config }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(region) = &self.config.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        if let Some(profile) = &self.config.profile {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        args.push("--output".to_string());
        args.push("json".to_string());
        args
    }

    async fn aws(&self, args: &[String]) -> Result<String, CloudError> {
        let mut full_args = self.base_args();
        full_args.extend(args.iter().cloned());
        debug!("aws {}", full_args.join(" "));

        let output = Command::new("aws")
            .args(&full_args)
            .output()
            .await
            .map_err(|e| CloudError::Api(format!("failed to run aws CLI: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // EC2 is eventually consistent: a just-launched id can be unknown.
            if stderr.contains("InvalidInstanceID.NotFound") {
                return Err(CloudError::NotFound(stderr));
            }
            return Err(CloudError::Api(format!(
                "aws {}: {}",
                args.iter().take(2).cloned().collect::<Vec<_>>().join(" "),
                stderr
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_instances_args(&self, request: &LaunchRequest) -> Vec<String> {
        let mut args = vec![
            "ec2".to_string(),
            "run-instances".to_string(),
            "--image-id".to_string(),
            request.image_id.clone(),
            "--instance-type".to_string(),
            request.shape.clone(),
            "--count".to_string(),
            "1".to_string(),
        ];
        if let Some(key_name) = &self.config.key_name {
            args.push("--key-name".to_string());
            args.push(key_name.clone());
        }
        if let Some(zone) = &request.zone {
            args.push("--placement".to_string());
            args.push(format!("AvailabilityZone={}", zone));
        }
        if !request.tags.is_empty() {
            args.push("--tag-specifications".to_string());
            args.push(tag_specification(&request.tags));
        }
        args
    }

    async fn describe_instance(&self, handle: &InstanceHandle) -> Result<InstanceEntry, CloudError> {
        let stdout = self
            .aws(&[
                "ec2".to_string(),
                "describe-instances".to_string(),
                "--instance-ids".to_string(),
                handle.id().to_string(),
            ])
            .await?;
        find_instance(&stdout, handle.id())
    }

    pub(crate) fn ssh_args(&self, address: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if let Some(key) = &self.config.ssh_key {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().into_owned());
        }
        args.push(format!("{}@{}", self.config.ssh_user, address));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl InstanceClient for AwsCliClient {
    async fn resolve_image(&self, release: &str) -> Result<String, CloudError> {
        let pattern = release_image_pattern(release);
        info!("Searching for daily image of {}", release);
        let stdout = self
            .aws(&[
                "ec2".to_string(),
                "describe-images".to_string(),
                "--filters".to_string(),
                format!("Name=name,Values={}", pattern),
            ])
            .await?;
        let images = parse_describe_images(&stdout)?;
        select_latest_image(&images, &pattern, release)
    }

    async fn create(&self, request: &LaunchRequest) -> Result<InstanceHandle, CloudError> {
        info!("Launching {} with {}", request.shape, request.image_id);
        let args = self.run_instances_args(request);

        // A rejected launch is a provider decision, not an API hiccup.
        let stdout = self.aws(&args).await.map_err(|err| match err {
            CloudError::Api(message) => CloudError::Provisioning(message),
            other => other,
        })?;
        parse_run_instances(&stdout).map(InstanceHandle::new)
    }

    async fn state(&self, handle: &InstanceHandle) -> Result<InstanceState, CloudError> {
        let stdout = self
            .aws(&[
                "ec2".to_string(),
                "describe-instance-status".to_string(),
                "--include-all-instances".to_string(),
                "--instance-ids".to_string(),
                handle.id().to_string(),
            ])
            .await?;
        parse_instance_status(&stdout, handle.id())
    }

    async fn restart(&self, handle: &InstanceHandle) -> Result<(), CloudError> {
        info!("Rebooting {}", handle);
        self.aws(&[
            "ec2".to_string(),
            "reboot-instances".to_string(),
            "--instance-ids".to_string(),
            handle.id().to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn run(
        &self,
        handle: &InstanceHandle,
        command: &str,
    ) -> Result<CommandOutput, CloudError> {
        let address = self
            .public_address(handle)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("public address of {}", handle)))?;

        debug!("ssh {}: {}", address, command);
        let output = Command::new("ssh")
            .args(self.ssh_args(&address, command))
            .output()
            .await
            .map_err(|e| CloudError::Api(format!("failed to run ssh: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        // Killed by a signal: no code at all.
        let exit_code = output.status.code().unwrap_or(-1);

        if exit_code == SSH_FAILURE_STATUS && is_ssh_failure(&stderr) {
            return Err(CloudError::Connection(classify_ssh_failure(&stderr)));
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn public_address(
        &self,
        handle: &InstanceHandle,
    ) -> Result<Option<String>, CloudError> {
        Ok(self.describe_instance(handle).await?.public_ip_address)
    }

    async fn zone(&self, handle: &InstanceHandle) -> Result<Option<String>, CloudError> {
        let instance = self.describe_instance(handle).await?;
        Ok(instance.placement.and_then(|p| p.availability_zone))
    }

    async fn destroy(&self, handle: InstanceHandle) -> Result<(), CloudError> {
        info!("Terminating {}", handle);
        self.aws(&[
            "ec2".to_string(),
            "terminate-instances".to_string(),
            "--instance-ids".to_string(),
            handle.id().to_string(),
        ])
        .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "aws-cli"
    }
}

fn tag_specification(tags: &[Tag]) -> String {
    let tags = tags
        .iter()
        .map(|(key, value)| format!("{{Key={},Value={}}}", key, value))
        .collect::<Vec<_>>()
        .join(",");
    format!("ResourceType=instance,Tags=[{}]", tags)
}

/// Lowercased fragments of the messages ssh itself prints before exiting 255.
const SSH_DIAGNOSTICS: &[&str] = &[
    "ssh:",
    "connection refused",
    "connection timed out",
    "no route to host",
    "connection closed by",
    "connection reset",
    "closed by remote host",
    "kex_exchange_identification",
    "banner exchange",
    "client_loop:",
    "broken pipe",
    "permission denied (",
    "host key verification failed",
];

fn last_line(stderr: &str) -> &str {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
}

/// Whether a 255 exit came from ssh rather than from the remote command.
fn is_ssh_failure(stderr: &str) -> bool {
    let line = last_line(stderr).to_lowercase();
    SSH_DIAGNOSTICS.iter().any(|marker| line.contains(marker))
}

fn classify_ssh_failure(stderr: &str) -> ConnectionError {
    let message = stderr.trim().to_string();
    let lower = last_line(stderr).to_lowercase();
    let kind = if lower.contains("connection refused") {
        ConnectionErrorKind::Refused
    } else if lower.contains("connection closed")
        || lower.contains("connection reset")
        || lower.contains("closed by remote host")
        || lower.contains("kex_exchange_identification")
        || lower.contains("broken pipe")
    {
        ConnectionErrorKind::Dropped
    } else if lower.contains("timed out") || lower.contains("no route to host") {
        ConnectionErrorKind::TimedOut
    } else {
        ConnectionErrorKind::Other
    };
    ConnectionError::new(kind, message)
}

#[derive(Debug, Deserialize)]
struct DescribeImages {
    #[serde(rename = "Images", default)]
    images: Vec<ImageEntry>,
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    #[serde(rename = "ImageId")]
    image_id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "CreationDate")]
    creation_date: String,
}

#[derive(Debug, Deserialize)]
struct RunInstances {
    #[serde(rename = "Instances", default)]
    instances: Vec<InstanceEntry>,
}

#[derive(Debug, Deserialize)]
struct InstanceEntry {
    #[serde(rename = "InstanceId")]
    instance_id: String,
    #[serde(rename = "PublicIpAddress", default)]
    public_ip_address: Option<String>,
    #[serde(rename = "Placement", default)]
    placement: Option<PlacementEntry>,
}

#[derive(Debug, Deserialize)]
struct PlacementEntry {
    #[serde(rename = "AvailabilityZone", default)]
    availability_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DescribeInstanceStatus {
    #[serde(rename = "InstanceStatuses", default)]
    statuses: Vec<StatusEntry>,
}

#[derive(Debug, Deserialize)]
struct StatusEntry {
    #[serde(rename = "InstanceState")]
    state: StateEntry,
}

#[derive(Debug, Deserialize)]
struct StateEntry {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct DescribeInstances {
    #[serde(rename = "Reservations", default)]
    reservations: Vec<RunInstances>,
}

fn decode<'a, T: Deserialize<'a>>(stdout: &'a str, what: &str) -> Result<T, CloudError> {
    serde_json::from_str(stdout)
        .map_err(|e| CloudError::Api(format!("unexpected {} response: {}", what, e)))
}

fn parse_describe_images(stdout: &str) -> Result<Vec<ImageRecord>, CloudError> {
    let response: DescribeImages = decode(stdout, "describe-images")?;
    response
        .images
        .into_iter()
        .map(|entry| {
            let created = DateTime::parse_from_rfc3339(&entry.creation_date)
                .map_err(|e| {
                    CloudError::Api(format!(
                        "bad CreationDate '{}' on {}: {}",
                        entry.creation_date, entry.image_id, e
                    ))
                })?
                .with_timezone(&Utc);
            Ok(ImageRecord {
                image_id: entry.image_id,
                name: entry.name,
                created,
            })
        })
        .collect()
}

fn parse_run_instances(stdout: &str) -> Result<String, CloudError> {
    let response: RunInstances = decode(stdout, "run-instances")?;
    response
        .instances
        .into_iter()
        .next()
        .map(|instance| instance.instance_id)
        .ok_or_else(|| CloudError::Provisioning("run-instances returned no instance".to_string()))
}

fn parse_instance_status(stdout: &str, id: &str) -> Result<InstanceState, CloudError> {
    let response: DescribeInstanceStatus = decode(stdout, "describe-instance-status")?;
    response
        .statuses
        .first()
        .map(|status| InstanceState::from_name(&status.state.name))
        .ok_or_else(|| CloudError::NotFound(format!("status of {}", id)))
}

fn find_instance(stdout: &str, id: &str) -> Result<InstanceEntry, CloudError> {
    let response: DescribeInstances = decode(stdout, "describe-instances")?;
    response
        .reservations
        .into_iter()
        .flat_map(|reservation| reservation.instances)
        .find(|instance| instance.instance_id == id)
        .ok_or_else(|| CloudError::NotFound(id.to_string()))
}
