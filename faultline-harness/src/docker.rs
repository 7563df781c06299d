//! [`ContainerRuntime`] over the Docker Engine API.
//!
//! Containers and networks are addressed by name or id; Docker accepts
//! either for every call used here.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, NetworkingConfig, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::{EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use faultline_core::runtime::{ContainerRuntime, ContainerSpec, NetworkInfo};
use faultline_core::RuntimeError;

use crate::error::HarnessError;

/// Seconds Docker waits for a container to exit before killing it.
const STOP_TIMEOUT_SECS: i64 = 10;

/// Docker-backed container runtime.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the local socket).
    pub fn connect() -> Result<Self, HarnessError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// The underlying client.
    pub fn client(&self) -> &Docker {
        &self.docker
    }
}

/// Map a Docker error onto the runtime error model.
fn map_err(operation: &'static str, target: &str, err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(target.to_string()),
        DockerError::DockerResponseServerError { message, .. } => RuntimeError::Operation {
            operation,
            target: target.to_string(),
            message,
        },
        other => RuntimeError::Operation {
            operation,
            target: target.to_string(),
            message: other.to_string(),
        },
    }
}

/// Docker answers 304 when a container is already in the requested state.
fn not_modified(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &spec.ports {
        exposed_ports.insert(port.key(), HashMap::new());
        port_bindings.insert(
            port.key(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.host_port.to_string()),
            }]),
        );
    }

    let binds: Vec<String> = spec.volumes.iter().map(|v| v.to_bind()).collect();

    let networking_config = spec.network.as_ref().map(|attachment| {
        let endpoint = EndpointSettings {
            ipam_config: attachment.ipv4.map(|ip| EndpointIpamConfig {
                ipv4_address: Some(ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        NetworkingConfig {
            endpoints_config: HashMap::from([(attachment.network.clone(), endpoint)]),
        }
    });

    Config {
        image: Some(spec.image.clone()),
        env: (!spec.env.is_empty()).then(|| spec.env.clone()),
        cmd: spec.command.clone(),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(HostConfig {
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            binds: (!binds.is_empty()).then_some(binds),
            network_mode: spec.network.as_ref().map(|n| n.network.clone()),
            ..Default::default()
        }),
        networking_config,
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| map_err("create_container", &spec.name, e))?;

        for warning in &response.warnings {
            tracing::warn!("Docker warning for {}: {}", spec.name, warning);
        }
        tracing::debug!("Created container {} ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if not_modified(&e) => Ok(()),
            Err(e) => Err(map_err("start_container", id, e)),
        }
    }

    async fn pause_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .pause_container(id)
            .await
            .map_err(|e| map_err("pause_container", id, e))
    }

    async fn unpause_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(|e| map_err("unpause_container", id, e))
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if not_modified(&e) => Ok(()),
            Err(e) => Err(map_err("stop_container", id, e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            v: true,
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_err("remove_container", id, e))
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, RuntimeError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|e| map_err("list_networks", "*", e))?;

        Ok(networks
            .into_iter()
            .map(|network| {
                let ipv4 = network
                    .ipam
                    .and_then(|ipam| ipam.config)
                    .and_then(|configs| {
                        configs
                            .into_iter()
                            .find(|c| c.subnet.as_deref().is_some_and(|s| !s.contains(':')))
                    });
                NetworkInfo {
                    id: network.id.unwrap_or_default(),
                    name: network.name.unwrap_or_default(),
                    subnet: ipv4.as_ref().and_then(|c| c.subnet.clone()),
                    gateway: ipv4.and_then(|c| c.gateway),
                }
            })
            .collect())
    }

    async fn create_network(
        &self,
        name: &str,
        subnet: &str,
        gateway: Ipv4Addr,
    ) -> Result<String, RuntimeError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(subnet.to_string()),
                    gateway: Some(gateway.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };

        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(|e| map_err("create_network", name, e))?;

        tracing::info!("Created network {} ({}, gateway {})", name, subnet, gateway);
        Ok(response.id.unwrap_or_else(|| name.to_string()))
    }

    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_network(id)
            .await
            .map_err(|e| map_err("remove_network", id, e))
    }
}
