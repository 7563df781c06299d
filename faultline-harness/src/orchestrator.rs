//! Orchestrator: stands up a replica topology and drives one monitored run.
//!
//! ```text
//!  create_network ──► create_replicas ──► enable_chaos / spawn_proxy / register
//!                                                     │
//!                                               run(timeout) ──► Verdict
//!                                                     │
//!                                                 teardown
//! ```
//!
//! Each orchestrator gets a unique project name, used as the prefix of every
//! container it creates, so concurrent runs on one engine do not collide.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use faultline_core::runtime::{
    ContainerReplica, ContainerRuntime, ContainerSpec, NetworkAttachment, PortMapping, VolumeMount,
};
use faultline_core::{
    AddressError, ChaosProxy, ChaosScheduler, ChaosSpec, CompletionMonitor, NetworkAddressSpace,
    ProxyRoute, SignalHandle, SignalKind, Verdict,
};
use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::docker::DockerRuntime;
use crate::error::{HarnessError, Result};

/// A network the orchestrator allocates addresses from.
#[derive(Debug)]
pub struct Network {
    name: String,
    id: String,
    created: bool,
    space: Mutex<NetworkAddressSpace>,
}

impl Network {
    /// Network name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine-assigned id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this orchestrator created the network (and will remove it).
    pub fn created(&self) -> bool {
        self.created
    }

    /// Subnet in CIDR notation.
    pub fn subnet(&self) -> String {
        self.lock().subnet()
    }

    /// Gateway address.
    pub fn gateway(&self) -> Ipv4Addr {
        self.lock().gateway()
    }

    /// Next unused address on this network.
    pub fn allocate(&self) -> std::result::Result<Ipv4Addr, AddressError> {
        self.lock().next_address()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkAddressSpace> {
        self.space.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Blueprint for a group of identical replicas.
///
/// Replica `i` (zero-based) publishes each port at `host_port + i` (a
/// `host_port` of 0 leaves the choice to the engine for every replica) and
/// mounts each volume from `<host_path>/<name>-<i+1>`.
#[derive(Debug, Clone, Default)]
pub struct ReplicaTemplate {
    /// Base name; replicas are named `<project>-<name>-<n>`.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Number of replicas.
    pub count: usize,
    /// Network to attach to with a static address, if any.
    pub network: Option<String>,
    /// Ports, with the host port of replica 0.
    pub ports: Vec<PortMapping>,
    /// Volumes, with the host directory shared by all replicas.
    pub volumes: Vec<VolumeMount>,
    /// `KEY=value` environment entries.
    pub env: Vec<String>,
    /// Command override.
    pub command: Option<Vec<String>>,
}

impl ReplicaTemplate {
    /// A template with no ports, volumes or network.
    pub fn new(name: impl Into<String>, image: impl Into<String>, count: usize) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            count,
            ..Default::default()
        }
    }

    /// Attach replicas to `network` with static addresses.
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Publish `container_port` starting at `host_port`.
    pub fn port(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports.push(PortMapping::tcp(container_port, host_port));
        self
    }

    /// Mount a per-replica directory under `host_dir` at `container_path`.
    pub fn volume(mut self, host_dir: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        self.volumes.push(VolumeMount::bind(host_dir, container_path));
        self
    }

    /// Override the command.
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(HarnessError::InvalidTemplate("name is empty".into()));
        }
        if self.image.is_empty() {
            return Err(HarnessError::InvalidTemplate(format!(
                "{}: image is empty",
                self.name
            )));
        }
        if self.count == 0 {
            return Err(HarnessError::InvalidTemplate(format!(
                "{}: count must be at least 1",
                self.name
            )));
        }
        for port in &self.ports {
            if port.host_port as usize + self.count - 1 > u16::MAX as usize {
                return Err(HarnessError::InvalidTemplate(format!(
                    "{}: host port {} cannot be offset for {} replicas",
                    self.name, port.host_port, self.count
                )));
            }
        }
        Ok(())
    }

    fn replica_name(&self, index: usize) -> String {
        format!("{}-{}", self.name, index + 1)
    }
}

/// Replicas created from one template.
#[derive(Debug, Clone)]
pub struct ReplicaGroup {
    name: String,
    replicas: Vec<ContainerReplica>,
}

impl ReplicaGroup {
    /// Template name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replicas in index order.
    pub fn replicas(&self) -> &[ContainerReplica] {
        &self.replicas
    }

    /// Static addresses, in index order (empty without a network).
    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        self.replicas.iter().filter_map(|r| r.address).collect()
    }

    /// Number of replicas.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// True for an empty group.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

/// Builds a topology, runs participants under a [`CompletionMonitor`], and
/// tears everything down.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    project: String,
    volume_root: PathBuf,
    networks: HashMap<String, Arc<Network>>,
    replicas: Vec<ContainerReplica>,
    monitor: CompletionMonitor,
    pending_chaos: Vec<(ChaosScheduler, SignalHandle)>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project", &self.project)
            .field("networks", &self.networks.keys().collect::<Vec<_>>())
            .field("replicas", &self.replicas.len())
            .field("participants", &self.monitor.participants())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator over `runtime` with a fresh project name.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        let project = format!("faultline-{}", uuid::Uuid::new_v4().as_simple());
        let volume_root = std::env::temp_dir().join(&project);

        Self {
            runtime,
            project,
            volume_root,
            networks: HashMap::new(),
            replicas: Vec::new(),
            monitor: CompletionMonitor::new(),
            pending_chaos: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Create an orchestrator backed by the local Docker engine.
    pub fn docker() -> Result<Self> {
        Ok(Self::new(Arc::new(DockerRuntime::connect()?)))
    }

    /// Root for relative volume host paths (default: `<tmp>/<project>`).
    pub fn with_volume_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.volume_root = root.into();
        self
    }

    /// Unique project name of this orchestrator.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// A network created or adopted by [`create_network`](Self::create_network).
    pub fn network(&self, name: &str) -> Option<Arc<Network>> {
        self.networks.get(name).cloned()
    }

    /// Every replica created so far.
    pub fn replicas(&self) -> &[ContainerReplica] {
        &self.replicas
    }

    // ========================================================================
    // Topology
    // ========================================================================

    /// Create a network, or adopt an existing one of the same name.
    ///
    /// An adopted network keeps its own subnet and gateway when the engine
    /// reports them.
    pub async fn create_network(
        &mut self,
        name: &str,
        gateway: &str,
        subnet: &str,
    ) -> Result<Arc<Network>> {
        if let Some(network) = self.networks.get(name) {
            return Ok(network.clone());
        }

        let requested = NetworkAddressSpace::parse(gateway, subnet)?;
        let existing = self
            .runtime
            .list_networks()
            .await?
            .into_iter()
            .find(|n| n.name == name);

        let network = match existing {
            Some(info) => {
                let space = match (info.gateway.as_deref(), info.subnet.as_deref()) {
                    (Some(gateway), Some(subnet)) => NetworkAddressSpace::parse(gateway, subnet)
                        .map_err(|_| HarnessError::NetworkWithoutSubnet {
                            name: name.to_string(),
                        })?,
                    _ => requested,
                };
                tracing::info!("Reusing network {} ({})", name, space);
                Network {
                    name: name.to_string(),
                    id: info.id,
                    created: false,
                    space: Mutex::new(space),
                }
            }
            None => {
                let id = self
                    .runtime
                    .create_network(name, &requested.subnet(), requested.gateway())
                    .await?;
                tracing::info!("Created network {} ({})", name, requested);
                Network {
                    name: name.to_string(),
                    id,
                    created: true,
                    space: Mutex::new(requested),
                }
            }
        };

        let network = Arc::new(network);
        self.networks.insert(name.to_string(), network.clone());
        Ok(network)
    }

    /// Create and start every replica of `template`.
    ///
    /// Addresses are allocated for the whole group before any container is
    /// created. Containers are then created and started concurrently; if any
    /// fails, the ones that were created are still torn down by
    /// [`teardown`](Self::teardown).
    pub async fn create_replicas(&mut self, template: &ReplicaTemplate) -> Result<ReplicaGroup> {
        template.validate()?;

        let network = match &template.network {
            Some(name) => Some(
                self.networks
                    .get(name)
                    .cloned()
                    .ok_or_else(|| HarnessError::UnknownNetwork(name.clone()))?,
            ),
            None => None,
        };

        let mut planned = Vec::with_capacity(template.count);
        for index in 0..template.count {
            let address = match &network {
                Some(network) => Some(network.allocate()?),
                None => None,
            };
            planned.push(self.replica_spec(template, index, address));
        }

        for (spec, _) in &planned {
            for volume in &spec.volumes {
                if let Err(e) = tokio::fs::create_dir_all(&volume.host_path).await {
                    return Err(HarnessError::InvalidTemplate(format!(
                        "{}: cannot create volume directory {}: {}",
                        spec.name,
                        volume.host_path.display(),
                        e
                    )));
                }
            }
        }

        let runtime = self.runtime.clone();
        let results = join_all(planned.into_iter().enumerate().map(|(index, (spec, address))| {
            let runtime = runtime.clone();
            async move {
                let id = runtime
                    .create_container(&spec)
                    .await
                    .map_err(|e| (None, e))?;
                let replica = ContainerReplica {
                    index,
                    name: spec.name.clone(),
                    container_id: id,
                    address,
                    ports: spec.ports.clone(),
                    volumes: spec.volumes.clone(),
                };
                // Keep the replica for teardown even when start fails.
                match runtime.start_container(&replica.container_id).await {
                    Ok(()) => Ok(replica),
                    Err(e) => Err((Some(replica), e)),
                }
            }
        }))
        .await;

        let mut replicas = Vec::with_capacity(template.count);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(replica) => {
                    tracing::info!(
                        "Started replica {}{}",
                        replica.name,
                        replica
                            .address
                            .map(|a| format!(" at {}", a))
                            .unwrap_or_default()
                    );
                    self.replicas.push(replica.clone());
                    replicas.push(replica);
                }
                Err((created, e)) => {
                    if let Some(replica) = created {
                        self.replicas.push(replica);
                    }
                    tracing::error!("Replica setup failed for {}: {}", template.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e.into());
        }

        Ok(ReplicaGroup {
            name: template.name.clone(),
            replicas,
        })
    }

    fn replica_spec(
        &self,
        template: &ReplicaTemplate,
        index: usize,
        address: Option<Ipv4Addr>,
    ) -> (ContainerSpec, Option<Ipv4Addr>) {
        let replica_name = template.replica_name(index);
        let offset = index as u16;

        let ports = template
            .ports
            .iter()
            .map(|p| PortMapping {
                container_port: p.container_port,
                host_port: if p.host_port == 0 { 0 } else { p.host_port + offset },
                protocol: p.protocol.clone(),
            })
            .collect();

        let volumes = template
            .volumes
            .iter()
            .map(|v| VolumeMount {
                host_path: self.volume_path(&v.host_path).join(&replica_name),
                container_path: v.container_path.clone(),
                read_only: v.read_only,
            })
            .collect();

        let spec = ContainerSpec {
            image: template.image.clone(),
            name: format!("{}-{}", self.project, replica_name),
            ports,
            volumes,
            network: template.network.as_ref().map(|network| NetworkAttachment {
                network: network.clone(),
                ipv4: address,
            }),
            env: template.env.clone(),
            command: template.command.clone(),
        };
        (spec, address)
    }

    fn volume_path(&self, host_path: &Path) -> PathBuf {
        if host_path.is_absolute() {
            host_path.to_path_buf()
        } else {
            self.volume_root.join(host_path)
        }
    }

    // ========================================================================
    // Participants
    // ========================================================================

    /// Pause/unpause `group` during the next [`run`](Self::run).
    ///
    /// The scheduler is registered as an Error participant: it only affects
    /// the verdict when a pause or unpause fails. When the run has no Done
    /// participants of its own, the scheduler finishing is what ends it.
    pub fn enable_chaos(&mut self, group: &ReplicaGroup, spec: ChaosSpec) -> Result<()> {
        let scheduler = ChaosScheduler::new(self.runtime.clone(), group.replicas().to_vec(), spec)?;
        let handle = self
            .monitor
            .register_named(format!("chaos-{}", group.name()), SignalKind::Error);
        self.pending_chaos.push((scheduler, handle));
        Ok(())
    }

    /// Start a chaos proxy now and return its bound address.
    ///
    /// The proxy serves until the next [`run`](Self::run) resolves; a dead
    /// route is reported to the monitor as an Error.
    pub async fn spawn_proxy(&mut self, route: ProxyRoute) -> Result<SocketAddr> {
        let proxy = ChaosProxy::bind(route).await?;
        let addr = proxy.local_addr();
        let handle = self
            .monitor
            .register_named(format!("proxy-{}", addr), SignalKind::Error);

        let label = handle.label().to_string();
        let task = tokio::spawn(async move {
            let shutdown = handle.shutdown();
            if let Err(e) = proxy.serve(shutdown).await {
                if let Err(send) = handle.error(e) {
                    tracing::debug!("Proxy error after run ended: {}", send);
                }
            }
        });
        self.tasks.push((label, task));
        Ok(addr)
    }

    /// Register a test participant with a generated label.
    pub fn register(&mut self, kind: SignalKind) -> SignalHandle {
        self.monitor.register(kind)
    }

    /// Register a test participant under `label`.
    pub fn register_named(&mut self, label: impl Into<String>, kind: SignalKind) -> SignalHandle {
        self.monitor.register_named(label, kind)
    }

    /// Start chaos, wait for the verdict, then wait for every participant
    /// task to observe end-all.
    ///
    /// The next run starts with a fresh monitor.
    pub async fn run(&mut self, timeout: Duration) -> Verdict {
        let mut monitor = std::mem::take(&mut self.monitor);
        let chaos_holds_run = monitor.expected_done() == 0;

        for (scheduler, handle) in self.pending_chaos.drain(..) {
            let label = handle.label().to_string();
            let finished = chaos_holds_run
                .then(|| monitor.register_named(format!("{}-finished", label), SignalKind::Done));
            let task = tokio::spawn(async move {
                match scheduler.run(handle.shutdown()).await {
                    Ok(report) => {
                        tracing::info!(
                            "{}: {} pause(s), {} skipped",
                            handle.label(),
                            report.pauses,
                            report.skipped
                        );
                        if let Some(Err(send)) = finished.map(SignalHandle::done) {
                            tracing::debug!("Chaos finished after run ended: {}", send);
                        }
                    }
                    Err(e) => {
                        if let Err(send) = handle.error(e) {
                            tracing::debug!("Chaos error after run ended: {}", send);
                        }
                    }
                }
            });
            self.tasks.push((label, task));
        }

        tracing::info!(
            "Run {} started: {} participant(s), {} expected done, timeout {:?}",
            self.project,
            monitor.participants(),
            monitor.expected_done(),
            timeout
        );

        let verdict = monitor.wait(timeout).await;

        for (label, task) in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("Participant {} did not finish cleanly: {}", label, e);
            }
        }

        tracing::info!("Run {} {}", self.project, verdict);
        verdict
    }

    /// Stop and remove every replica, then remove networks this orchestrator
    /// created. Keeps going past failures and returns the first one.
    pub async fn teardown(&mut self) -> Result<()> {
        let replicas = std::mem::take(&mut self.replicas);
        let runtime = self.runtime.clone();

        let results = join_all(replicas.iter().map(|replica| {
            let runtime = runtime.clone();
            async move {
                runtime.stop_container(&replica.container_id).await?;
                runtime.remove_container(&replica.container_id).await
            }
        }))
        .await;

        let mut first_error = None;
        for (replica, result) in replicas.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Failed to remove replica {}: {}", replica.name, e);
                first_error.get_or_insert(e);
            }
        }

        for (name, network) in self.networks.drain() {
            if !network.created {
                continue;
            }
            if let Err(e) = self.runtime.remove_network(&network.id).await {
                tracing::warn!("Failed to remove network {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }

        tracing::info!("Teardown of {} complete", self.project);
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
