//! Docker engine runtime via bollard.

use std::collections::{HashMap, HashSet};

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use tracing::{debug, warn};

use super::{
    ContainerRuntime, ContainerSpec, ProvisionError, RemoveOutcome, DISPLAY_CONTAINER_PORT,
    SELENIUM_CONTAINER_PORT,
};

impl From<DockerError> for ProvisionError {
    fn from(e: DockerError) -> Self {
        ProvisionError::Runtime(e.to_string())
    }
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the local defaults (unix socket or `DOCKER_HOST`).
    pub fn connect() -> Result<Self, ProvisionError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

fn is_not_found(e: &DockerError) -> bool {
    matches!(
        e,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn tcp(port: u16) -> String {
    format!("{port}/tcp")
}

/// Host config publishing both container ports and sizing memory.
pub fn host_config(spec: &ContainerSpec) -> HostConfig {
    let bind = |host: u16| {
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(host.to_string()),
        }])
    };

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = [
        (tcp(SELENIUM_CONTAINER_PORT), bind(spec.ports.selenium)),
        (tcp(DISPLAY_CONTAINER_PORT), bind(spec.ports.display)),
    ]
    .into_iter()
    .collect();

    HostConfig {
        port_bindings: Some(port_bindings),
        memory: Some(spec.memory_bytes),
        shm_size: Some(spec.shm_bytes),
        network_mode: spec.network.clone(),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn prune_exited(&self) -> Result<usize, ProvisionError> {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["exited".to_string()]);
        let exited = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut removed = 0;
        for container in exited {
            let Some(id) = container.id else { continue };
            match self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => removed += 1,
                Err(e) if is_not_found(&e) => {}
                Err(e) => warn!(container_id = %id, error = %e, "failed to remove exited container"),
            }
        }
        Ok(removed)
    }

    async fn published_ports(&self) -> Result<HashSet<u16>, ProvisionError> {
        let running = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        let ports: HashSet<u16> = running
            .into_iter()
            .flat_map(|c| c.ports.unwrap_or_default())
            .filter_map(|p| p.public_port)
            .collect();
        debug!(count = ports.len(), "published host ports");
        Ok(ports)
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<String, ProvisionError> {
        let exposed: HashMap<String, HashMap<(), ()>> = [
            (tcp(SELENIUM_CONTAINER_PORT), HashMap::new()),
            (tcp(DISPLAY_CONTAINER_PORT), HashMap::new()),
        ]
        .into_iter()
        .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            exposed_ports: Some(exposed),
            host_config: Some(host_config(spec)),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| ProvisionError::ContainerStart {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ProvisionError::ContainerStart {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        Ok(created.id)
    }

    async fn is_running(&self, name: &str) -> Result<bool, ProvisionError> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;
        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn remove(&self, name: &str) -> Result<RemoveOutcome, ProvisionError> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => return Ok(RemoveOutcome::NotFound),
            Err(e) => warn!(container = %name, error = %e, "failed to stop container (may already be stopped)"),
        }

        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(RemoveOutcome::Removed),
            Err(e) if is_not_found(&e) => Ok(RemoveOutcome::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}
