//! Disposable browser environments: port allocation, container lifecycle
//! and the runtime abstraction the provisioner drives.

pub mod docker;
pub mod ports;
pub mod provisioner;

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;

pub use self::ports::PortAllocator;
pub use self::provisioner::{ContainerProvisioner, Environment};

/// WebDriver port inside the browser image.
pub const SELENIUM_CONTAINER_PORT: u16 = 4444;

/// VNC display port inside the browser image.
pub const DISPLAY_CONTAINER_PORT: u16 = 5900;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(
        "no free port pair within {window} offsets of {selenium_base}/{display_base}"
    )]
    NoPortsAvailable {
        selenium_base: u16,
        display_base: u16,
        window: u16,
    },

    #[error("container {name} failed to start: {reason}")]
    ContainerStart { name: String, reason: String },

    #[error("container {name} not running after {waited_secs}s")]
    ContainerNotReady { name: String, waited_secs: u64 },

    #[error("no browser session after {attempts} attempts: {last_error}")]
    SessionUnavailable { attempts: u32, last_error: String },

    #[error("container runtime error: {0}")]
    Runtime(String),
}

/// Host ports published for one browser container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortPair {
    pub selenium: u16,
    pub display: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    Creating,
    Ready,
    Unreachable,
}

/// One provisioned browser container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerHandle {
    pub name: String,
    pub id: String,
    pub ports: PortPair,
    pub readiness: Readiness,
}

/// What to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: Option<String>,
    pub ports: PortPair,
    pub memory_bytes: i64,
    pub shm_bytes: i64,
}

impl ContainerSpec {
    /// Container names encode both host ports.
    pub fn container_name(ports: PortPair) -> String {
        format!("selenium_vnc_{}_{}", ports.selenium, ports.display)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

/// The container engine as seen by the provisioner.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Remove containers in the exited state. Returns how many went away.
    async fn prune_exited(&self) -> Result<usize, ProvisionError>;

    /// Host ports published by containers that are currently running.
    async fn published_ports(&self) -> Result<HashSet<u16>, ProvisionError>;

    /// Create and start a container, returning its id.
    async fn start(&self, spec: &ContainerSpec) -> Result<String, ProvisionError>;

    async fn is_running(&self, name: &str) -> Result<bool, ProvisionError>;

    /// Stop and remove a container by name.
    async fn remove(&self, name: &str) -> Result<RemoveOutcome, ProvisionError>;
}
