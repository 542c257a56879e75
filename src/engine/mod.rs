//! Narrow capability set over the container engine.
//!
//! The action engine is polymorphic over [`EngineClient`]; the production
//! implementation wraps bollard, unit tests run against the in-memory fake.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod docker;

#[cfg(test)]
pub mod fake;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{op} timed out")]
    Timeout { op: &'static str },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{op} failed: {message}")]
    Api { op: &'static str, message: String },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    None,
    Starting,
    Healthy,
    Unhealthy,
}

impl AsRef<str> for HealthState {
    fn as_ref(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// One row of `list containers`.
#[derive(Debug, Clone)]
pub struct ContainerBrief {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub image_id: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub created_ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
    Other,
}

#[derive(Debug, Clone)]
pub struct MountInfo {
    pub kind: MountKind,
    pub source: String,
    pub destination: String,
    /// Volume driver, for volume mounts.
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthcheckSpec {
    pub test: Vec<String>,
    pub interval_ns: Option<i64>,
    pub timeout_ns: Option<i64>,
    pub retries: Option<i64>,
    pub start_period_ns: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub name: String,
    pub aliases: Vec<String>,
    pub links: Vec<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
}

/// Everything needed to recreate a container under a new name while
/// preserving its observable configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateSpec {
    pub image: String,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<i64>,
    pub exposed_ports: Vec<String>,
    pub healthcheck: Option<HealthcheckSpec>,
    pub tty: bool,
    pub open_stdin: bool,
    pub restart_policy: Option<String>,
    pub binds: Vec<String>,
    pub network_mode: Option<String>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub networks: Vec<NetworkAttachment>,
}

/// Full inspection snapshot of one container.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub image_id: String,
    pub labels: HashMap<String, String>,
    pub links: Vec<String>,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub health: HealthState,
    pub has_healthcheck: bool,
    pub mounts: Vec<MountInfo>,
    pub spec: CreateSpec,
}

#[async_trait]
pub trait EngineClient: Send + Sync + 'static {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerBrief>, EngineError>;

    async fn inspect_container(&self, name: &str) -> Result<ContainerDetails, EngineError>;

    /// Pull an image by reference; returns the post-pull image id.
    async fn pull_image(&self, reference: &str) -> Result<String, EngineError>;

    /// Image id the local daemon has for a reference, if any.
    async fn local_image_id(&self, reference: &str) -> Result<Option<String>, EngineError>;

    /// Create a container from a spec; returns the new container id.
    async fn create_container(&self, name: &str, spec: &CreateSpec)
        -> Result<String, EngineError>;

    async fn rename_container(&self, name: &str, new_name: &str) -> Result<(), EngineError>;

    async fn start_container(&self, name: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, name: &str, timeout_seconds: i64) -> Result<(), EngineError>;

    async fn kill_container(&self, name: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, name: &str) -> Result<(), EngineError>;

    async fn remove_image(&self, image: &str) -> Result<(), EngineError>;

    async fn health_status(&self, name: &str) -> Result<HealthState, EngineError>;

    /// Run a shell command inside a container; returns the exit code.
    async fn exec_in_container(
        &self,
        name: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<i64, EngineError>;

    /// Prune unused, non-dangling images; returns bytes reclaimed.
    async fn prune_images(&self, timeout: Duration) -> Result<i64, EngineError>;
}
