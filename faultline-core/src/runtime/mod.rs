//! Container runtime abstraction.
//!
//! Faultline never talks to a container engine directly. Everything that
//! creates, starts, pauses or removes containers goes through the
//! [`ContainerRuntime`] trait, so the scheduler and orchestrator can be
//! exercised against [`MemoryRuntime`] in tests and against Docker in real
//! runs.

mod memory;

pub use memory::{ContainerState, MemoryContainer, MemoryRuntime, Operation, RuntimeEvent};

use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::RuntimeError;

/// A published port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortMapping {
    /// Port inside the container.
    pub container_port: u16,
    /// Port on the host.
    pub host_port: u16,
    /// `tcp` or `udp`.
    pub protocol: String,
}

impl PortMapping {
    /// A TCP port mapping.
    pub fn tcp(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port,
            protocol: "tcp".into(),
        }
    }

    /// The `port/protocol` key used by container engines.
    pub fn key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// A bind-mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeMount {
    /// Directory on the host.
    pub host_path: PathBuf,
    /// Mount point inside the container.
    pub container_path: String,
    /// Mount read-only.
    pub read_only: bool,
}

impl VolumeMount {
    /// A read-write bind mount.
    pub fn bind(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    /// `host:container[:ro]` bind specification.
    pub fn to_bind(&self) -> String {
        let mut bind = format!("{}:{}", self.host_path.display(), self.container_path);
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

/// Network attachment with an optional static address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    /// Network name.
    pub network: String,
    /// Static IPv4 address on that network.
    pub ipv4: Option<Ipv4Addr>,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Container name.
    pub name: String,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// Bind mounts.
    pub volumes: Vec<VolumeMount>,
    /// Network to attach to.
    pub network: Option<NetworkAttachment>,
    /// `KEY=value` environment entries.
    pub env: Vec<String>,
    /// Command override.
    pub command: Option<Vec<String>>,
}

/// A network known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Engine-assigned id.
    pub id: String,
    /// Network name.
    pub name: String,
    /// Subnet in CIDR notation, if configured.
    pub subnet: Option<String>,
    /// Gateway address, if configured.
    pub gateway: Option<String>,
}

/// One running member of a replica group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerReplica {
    /// Zero-based index within the group.
    pub index: usize,
    /// Container name.
    pub name: String,
    /// Engine-assigned container id (a name also works for Docker).
    pub container_id: String,
    /// Static address, when the orchestrator assigned one.
    pub address: Option<Ipv4Addr>,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// Bind mounts.
    pub volumes: Vec<VolumeMount>,
}

impl ContainerReplica {
    /// A replica known only by name, for containers created elsewhere.
    pub fn existing(index: usize, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            index,
            container_id: name.clone(),
            name,
            address: None,
            ports: Vec::new(),
            volumes: Vec::new(),
        }
    }
}

/// Container engine operations consumed by the harness.
///
/// Every call either succeeds or returns a [`RuntimeError`]; no
/// retryable/fatal distinction is made.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Freeze every process in a running container.
    async fn pause_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Resume a paused container.
    async fn unpause_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stop a container.
    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Remove a container (and its anonymous volumes).
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// List networks.
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, RuntimeError>;

    /// Create a network with a fixed subnet and gateway, returning its id.
    async fn create_network(
        &self,
        name: &str,
        subnet: &str,
        gateway: Ipv4Addr,
    ) -> Result<String, RuntimeError>;

    /// Remove a network.
    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_key_includes_protocol() {
        assert_eq!(PortMapping::tcp(27017, 37017).key(), "27017/tcp");
    }

    #[test]
    fn volume_bind_spec() {
        let mut volume = VolumeMount::bind("/tmp/faultline/db-1", "/data/db");
        assert_eq!(volume.to_bind(), "/tmp/faultline/db-1:/data/db");

        volume.read_only = true;
        assert_eq!(volume.to_bind(), "/tmp/faultline/db-1:/data/db:ro");
    }

    #[test]
    fn existing_replica_uses_name_as_id() {
        let replica = ContainerReplica::existing(2, "mongo-3");
        assert_eq!(replica.container_id, "mongo-3");
        assert_eq!(replica.index, 2);
        assert!(replica.address.is_none());
    }
}
