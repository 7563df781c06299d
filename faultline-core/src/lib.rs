//! # faultline-core
//!
//! Fault injection and run coordination for distributed-database tests.
//!
//! This crate has no container-engine dependency. It provides:
//! - [`ipam`]: sequential IPv4 allocation inside a network's subnet
//! - [`proxy`]: a TCP relay that adds random per-chunk latency
//! - [`scheduler`]: random pause/unpause of replicas under a concurrency cap
//! - [`monitor`]: Error/Fail/Done rendezvous that decides pass or fail
//! - [`runtime`]: the container-engine trait, plus an in-memory engine for tests
//!
//! `faultline-harness` wires these together against Docker.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod ipam;
pub mod monitor;
pub mod proxy;
pub mod runtime;
pub mod scheduler;
pub mod shutdown;

pub use error::{
    AddressError, AddressResult, MonitorError, ProxyError, ProxyResult, RuntimeError,
    RuntimeResult, SchedulerError, SchedulerResult,
};
pub use ipam::NetworkAddressSpace;
pub use monitor::{
    Cause, CompletionMonitor, Failure, MonitorState, Signal, SignalHandle, SignalKind, Verdict,
};
pub use proxy::{
    ChaosProxy, ChunkTransform, Direction, Identity, ProxyHandle, ProxyMetrics, ProxyRoute,
};
pub use runtime::{
    ContainerReplica, ContainerRuntime, ContainerSpec, MemoryRuntime, NetworkAttachment,
    NetworkInfo, PortMapping, VolumeMount,
};
pub use scheduler::{ChaosReport, ChaosScheduler, ChaosSpec};
pub use shutdown::{Shutdown, ShutdownTrigger};
