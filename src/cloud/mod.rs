//! # Instance Lifecycle Client
//!
//! The benchmark engine never talks to a cloud provider directly. Everything
//! it needs from the provider is captured by the `InstanceClient` trait,
//! injected into the runner as `Arc<dyn InstanceClient>`:
//!
//! - resolve a release to the most recent matching image
//! - create an instance from an image and shape, optionally next to another
//! - report power state, public address, zone, and restart on demand
//! - run a shell command over the remote command channel
//! - destroy the instance
//!
//! `create` is assumed to be asynchronous on the provider side; callers must
//! route through the readiness poller before using a fresh instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CloudError;

pub mod aws_cli;

pub use aws_cli::{AwsCliClient, AwsCliConfig};

/// Opaque reference to a provisioned instance.
///
/// Deliberately not `Clone`: exactly one owner holds it, and `destroy`
/// consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct InstanceHandle {
    id: String,
}

impl InstanceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Provider-reported power state, reduced to what the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Other(String),
}

impl InstanceState {
    /// Map a provider state name onto the reduced state set.
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            other => InstanceState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "pending"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Key/value tag applied at creation time.
pub type Tag = (String, String);

/// Everything `create` needs. Owned, so a launch can outlive its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub image_id: String,
    pub shape: String,
    pub tags: Vec<Tag>,
    /// Availability zone to launch in; the provider picks when unset
    pub zone: Option<String>,
}

impl LaunchRequest {
    pub fn new(image_id: impl Into<String>, shape: impl Into<String>, tags: Vec<Tag>) -> Self {
        Self {
            image_id: image_id.into(),
            shape: shape.into(),
            tags,
            zone: None,
        }
    }

    pub fn in_zone(mut self, zone: Option<String>) -> Self {
        self.zone = zone;
        self
    }
}

/// Capability set the benchmark engine requires from a cloud provider.
#[async_trait]
pub trait InstanceClient: Send + Sync {
    /// Find the image id to boot for an OS release.
    async fn resolve_image(&self, release: &str) -> Result<String, CloudError>;

    /// Request a new instance. Returns as soon as the provider accepts it.
    async fn create(&self, request: &LaunchRequest) -> Result<InstanceHandle, CloudError>;

    async fn state(&self, handle: &InstanceHandle) -> Result<InstanceState, CloudError>;

    async fn restart(&self, handle: &InstanceHandle) -> Result<(), CloudError>;

    /// Run a command over the remote command channel.
    async fn run(&self, handle: &InstanceHandle, command: &str)
        -> Result<CommandOutput, CloudError>;

    async fn public_address(&self, handle: &InstanceHandle)
        -> Result<Option<String>, CloudError>;

    /// Availability zone the instance was placed in.
    async fn zone(&self, handle: &InstanceHandle) -> Result<Option<String>, CloudError>;

    async fn destroy(&self, handle: InstanceHandle) -> Result<(), CloudError>;

    /// Provider name for logs.
    fn name(&self) -> &'static str;
}

/// An image as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub image_id: String,
    pub name: String,
    pub created: DateTime<Utc>,
}

/// Release-scoped naming pattern for daily server images.
pub fn release_image_pattern(release: &str) -> String {
    format!(
        "ubuntu/images-testing/hvm-ssd/ubuntu-{}-daily-amd64-server-*",
        release
    )
}

/// Pick the most recently created image whose name matches `pattern`.
pub fn select_latest_image(
    images: &[ImageRecord],
    pattern: &str,
    release: &str,
) -> Result<String, CloudError> {
    images
        .iter()
        .filter(|image| glob_match(pattern, &image.name))
        .max_by_key(|image| image.created)
        .map(|image| image.image_id.clone())
        .ok_or_else(|| CloudError::ImageNotFound {
            release: release.to_string(),
        })
}

/// Minimal `*`-only glob match, as used by provider name filters.
fn glob_match(pattern: &str, name: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = name.strip_prefix(first) else {
        return false;
    };

    let remaining: Vec<&str> = parts.collect();
    let Some((last, middle)) = remaining.split_last() else {
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}
