//! In-memory container runtime for testing.
//!
//! Tracks container state transitions, records every call with a timestamp
//! and can be told to fail the next call of a given operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;

use super::{ContainerRuntime, ContainerSpec, NetworkInfo};
use crate::error::RuntimeError;

/// Runtime operations, as recorded in [`RuntimeEvent`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create_container`
    CreateContainer,
    /// `start_container`
    StartContainer,
    /// `pause_container`
    PauseContainer,
    /// `unpause_container`
    UnpauseContainer,
    /// `stop_container`
    StopContainer,
    /// `remove_container`
    RemoveContainer,
    /// `list_networks`
    ListNetworks,
    /// `create_network`
    CreateNetwork,
    /// `remove_network`
    RemoveNetwork,
}

impl Operation {
    /// Method name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateContainer => "create_container",
            Operation::StartContainer => "start_container",
            Operation::PauseContainer => "pause_container",
            Operation::UnpauseContainer => "unpause_container",
            Operation::StopContainer => "stop_container",
            Operation::RemoveContainer => "remove_container",
            Operation::ListNetworks => "list_networks",
            Operation::CreateNetwork => "create_network",
            Operation::RemoveNetwork => "remove_network",
        }
    }
}

/// Lifecycle state of an in-memory container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Created, not started.
    Created,
    /// Running.
    Running,
    /// Paused.
    Paused,
    /// Stopped.
    Stopped,
}

/// A container held by [`MemoryRuntime`].
#[derive(Debug, Clone)]
pub struct MemoryContainer {
    /// Spec it was created from.
    pub spec: ContainerSpec,
    /// Current state.
    pub state: ContainerState,
}

/// A successful runtime call.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    /// When the call completed.
    pub at: Instant,
    /// Which operation.
    pub operation: Operation,
    /// Container or network id.
    pub target: String,
}

/// In-memory [`ContainerRuntime`].
///
/// Cloning shares state, so a test can keep a clone for inspection while
/// the code under test owns another.
#[derive(Debug, Default, Clone)]
pub struct MemoryRuntime {
    inner: Arc<Mutex<MemoryRuntimeInner>>,
}

#[derive(Debug, Default)]
struct MemoryRuntimeInner {
    next_id: u64,
    containers: BTreeMap<String, MemoryContainer>,
    networks: Vec<NetworkInfo>,
    events: Vec<RuntimeEvent>,
    fail_next: HashMap<Operation, String>,
}

impl MemoryRuntime {
    /// Create an empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cause the next call of `operation` to fail with `message`.
    pub fn fail_next(&self, operation: Operation, message: &str) {
        self.lock().fail_next.insert(operation, message.into());
    }

    /// Pre-populate a network, as if it already existed on the engine.
    pub fn add_network(&self, name: &str, subnet: &str, gateway: Ipv4Addr) -> String {
        let mut inner = self.lock();
        let id = inner.allocate_id("net");
        inner.networks.push(NetworkInfo {
            id: id.clone(),
            name: name.into(),
            subnet: Some(subnet.into()),
            gateway: Some(gateway.to_string()),
        });
        id
    }

    /// Pre-populate a running container, as if created elsewhere.
    pub fn add_running(&self, name: &str) {
        let mut inner = self.lock();
        inner.containers.insert(
            name.into(),
            MemoryContainer {
                spec: ContainerSpec {
                    name: name.into(),
                    ..Default::default()
                },
                state: ContainerState::Running,
            },
        );
    }

    /// Every successful call so far, in order.
    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.lock().events.clone()
    }

    /// Successful calls of one operation.
    pub fn events_of(&self, operation: Operation) -> Vec<RuntimeEvent> {
        self.lock()
            .events
            .iter()
            .filter(|event| event.operation == operation)
            .cloned()
            .collect()
    }

    /// Containers currently held, keyed by id.
    pub fn containers(&self) -> BTreeMap<String, MemoryContainer> {
        self.lock().containers.clone()
    }

    /// State of one container.
    pub fn state(&self, id: &str) -> Option<ContainerState> {
        self.lock().containers.get(id).map(|c| c.state)
    }

    /// Ids of containers that are currently paused.
    pub fn paused(&self) -> Vec<String> {
        self.lock()
            .containers
            .iter()
            .filter(|(_, c)| c.state == ContainerState::Paused)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Networks currently held.
    pub fn networks(&self) -> Vec<NetworkInfo> {
        self.lock().networks.clone()
    }

    /// Highest number of containers paused at the same time, from the event log.
    pub fn max_concurrently_paused(&self) -> usize {
        let mut paused = HashSet::new();
        let mut peak = 0;
        for event in self.lock().events.iter() {
            match event.operation {
                Operation::PauseContainer => {
                    paused.insert(event.target.clone());
                    peak = peak.max(paused.len());
                }
                Operation::UnpauseContainer => {
                    paused.remove(&event.target);
                }
                _ => {}
            }
        }
        peak
    }

    fn lock(&self) -> MutexGuard<'_, MemoryRuntimeInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(
        &self,
        operation: Operation,
        id: &str,
        from: &[ContainerState],
        to: ContainerState,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner.take_failure(operation, id)?;

        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if !from.contains(&container.state) {
            return Err(RuntimeError::Operation {
                operation: operation.as_str(),
                target: id.to_string(),
                message: format!("container is {:?}", container.state),
            });
        }
        container.state = to;
        inner.record(operation, id);
        Ok(())
    }
}

impl MemoryRuntimeInner {
    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }

    fn take_failure(&mut self, operation: Operation, target: &str) -> Result<(), RuntimeError> {
        match self.fail_next.remove(&operation) {
            Some(message) => Err(RuntimeError::Operation {
                operation: operation.as_str(),
                target: target.to_string(),
                message,
            }),
            None => Ok(()),
        }
    }

    fn record(&mut self, operation: Operation, target: &str) {
        self.events.push(RuntimeEvent {
            at: Instant::now(),
            operation,
            target: target.to_string(),
        });
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut inner = self.lock();
        inner.take_failure(Operation::CreateContainer, &spec.name)?;

        if inner.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(RuntimeError::Operation {
                operation: Operation::CreateContainer.as_str(),
                target: spec.name.clone(),
                message: "name already in use".into(),
            });
        }

        let id = inner.allocate_id("ctr");
        inner.containers.insert(
            id.clone(),
            MemoryContainer {
                spec: spec.clone(),
                state: ContainerState::Created,
            },
        );
        inner.record(Operation::CreateContainer, &id);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.transition(
            Operation::StartContainer,
            id,
            &[ContainerState::Created, ContainerState::Stopped],
            ContainerState::Running,
        )
    }

    async fn pause_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.transition(
            Operation::PauseContainer,
            id,
            &[ContainerState::Running],
            ContainerState::Paused,
        )
    }

    async fn unpause_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.transition(
            Operation::UnpauseContainer,
            id,
            &[ContainerState::Paused],
            ContainerState::Running,
        )
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.transition(
            Operation::StopContainer,
            id,
            &[
                ContainerState::Created,
                ContainerState::Running,
                ContainerState::Paused,
                ContainerState::Stopped,
            ],
            ContainerState::Stopped,
        )
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner.take_failure(Operation::RemoveContainer, id)?;
        inner
            .containers
            .remove(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        inner.record(Operation::RemoveContainer, id);
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, RuntimeError> {
        let mut inner = self.lock();
        inner.take_failure(Operation::ListNetworks, "networks")?;
        inner.record(Operation::ListNetworks, "networks");
        Ok(inner.networks.clone())
    }

    async fn create_network(
        &self,
        name: &str,
        subnet: &str,
        gateway: Ipv4Addr,
    ) -> Result<String, RuntimeError> {
        let mut inner = self.lock();
        inner.take_failure(Operation::CreateNetwork, name)?;

        if inner.networks.iter().any(|n| n.name == name) {
            return Err(RuntimeError::Operation {
                operation: Operation::CreateNetwork.as_str(),
                target: name.into(),
                message: "network already exists".into(),
            });
        }

        let id = inner.allocate_id("net");
        inner.networks.push(NetworkInfo {
            id: id.clone(),
            name: name.into(),
            subnet: Some(subnet.into()),
            gateway: Some(gateway.to_string()),
        });
        inner.record(Operation::CreateNetwork, &id);
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner.take_failure(Operation::RemoveNetwork, id)?;

        let before = inner.networks.len();
        inner.networks.retain(|n| n.id != id);
        if inner.networks.len() == before {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        inner.record(Operation::RemoveNetwork, id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            image: "redis:7".into(),
            name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let runtime = MemoryRuntime::new();
        let id = runtime.create_container(&spec("cache-1")).await.unwrap();
        assert_eq!(runtime.state(&id), Some(ContainerState::Created));

        runtime.start_container(&id).await.unwrap();
        runtime.pause_container(&id).await.unwrap();
        assert_eq!(runtime.paused(), vec![id.clone()]);

        // Pausing twice is an engine error, as with Docker.
        assert!(runtime.pause_container(&id).await.is_err());

        runtime.unpause_container(&id).await.unwrap();
        runtime.stop_container(&id).await.unwrap();
        runtime.remove_container(&id).await.unwrap();
        assert!(runtime.containers().is_empty());
    }

    #[tokio::test]
    async fn fail_next_affects_one_call() {
        let runtime = MemoryRuntime::new();
        runtime.add_running("db-1");
        runtime.fail_next(Operation::PauseContainer, "engine busy");

        let err = runtime.pause_container("db-1").await.unwrap_err();
        assert!(err.to_string().contains("engine busy"));
        runtime.pause_container("db-1").await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_names_rejected() {
        let runtime = MemoryRuntime::new();
        runtime.create_container(&spec("a")).await.unwrap();
        assert!(runtime.create_container(&spec("a")).await.is_err());
    }

    #[tokio::test]
    async fn peak_pause_count_from_events() {
        let runtime = MemoryRuntime::new();
        for name in ["a", "b", "c"] {
            runtime.add_running(name);
        }
        runtime.pause_container("a").await.unwrap();
        runtime.pause_container("b").await.unwrap();
        runtime.unpause_container("a").await.unwrap();
        runtime.pause_container("c").await.unwrap();

        assert_eq!(runtime.max_concurrently_paused(), 2);
    }

    #[tokio::test]
    async fn networks_round_trip() {
        let runtime = MemoryRuntime::new();
        let gateway: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let id = runtime
            .create_network("chaos-net", "10.0.0.0/16", gateway)
            .await
            .unwrap();

        let networks = runtime.list_networks().await.unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].name, "chaos-net");

        runtime.remove_network(&id).await.unwrap();
        assert!(runtime.remove_network(&id).await.is_err());
    }
}
