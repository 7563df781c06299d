//! # faultline-harness
//!
//! Orchestration of chaos runs against real containers.
//!
//! This crate connects `faultline-core` to a container engine:
//! - [`orchestrator`]: networks with static addressing, replica groups,
//!   chaos/proxy participants and a monitored run
//! - [`docker`]: the Docker Engine adapter for `ContainerRuntime`
//! - [`assertions`]: data-integrity checks that report as Fail signals

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assertions;
pub mod docker;
pub mod error;
pub mod orchestrator;

pub use assertions::{AssertionResult, ReplicaState, TopologyState};
pub use docker::DockerRuntime;
pub use error::{HarnessError, Result};
pub use orchestrator::{Network, Orchestrator, ReplicaGroup, ReplicaTemplate};
