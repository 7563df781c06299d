//! Error types for faultline-core.

use std::net::SocketAddr;

use crate::monitor::SignalKind;

/// Errors raised by the IPv4 allocator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The CIDR block could not be parsed or does not contain the gateway.
    #[error("invalid subnet {subnet}: {reason}")]
    InvalidSubnet {
        /// Subnet as given by the caller.
        subnet: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The gateway is not a valid IPv4 address.
    #[error("invalid gateway address: {0}")]
    InvalidGateway(String),

    /// Every address in the block has been handed out.
    #[error("address space exhausted in {subnet} (last allocated: {last})")]
    Exhausted {
        /// Subnet in normalized `base/prefix` form.
        subnet: String,
        /// The cursor value, unchanged by the failed call.
        last: std::net::Ipv4Addr,
    },
}

/// Errors raised by the chaos proxy.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Route configuration is unusable.
    #[error("invalid route {listen} -> {destination}: {reason}")]
    InvalidRoute {
        /// Listen address of the route.
        listen: SocketAddr,
        /// Destination of the route.
        destination: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Binding the listener failed. Fatal to the route.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A relayed connection failed. Never escapes its connection.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The listener kept failing to accept and was given up on.
    #[error("route {addr} is dead after {failures} consecutive accept failures: {source}")]
    RouteDead {
        /// Listen address of the dead route.
        addr: SocketAddr,
        /// Number of consecutive failures observed.
        failures: u32,
        /// The last accept error.
        source: std::io::Error,
    },
}

/// Errors returned by a [`ContainerRuntime`](crate::runtime::ContainerRuntime).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The engine rejected or failed an operation.
    #[error("{operation} failed for {target}: {message}")]
    Operation {
        /// Operation name (e.g. `pause_container`).
        operation: &'static str,
        /// Container or network the operation targeted.
        target: String,
        /// Engine-provided message.
        message: String,
    },

    /// The container or network does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Errors raised by the chaos scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The chaos spec is inconsistent.
    #[error("invalid chaos spec: {0}")]
    InvalidSpec(String),

    /// The scheduler was given an empty replica group.
    #[error("no replicas to schedule chaos against")]
    NoReplicas,

    /// Pausing a replica failed.
    #[error("failed to pause replica {replica}: {source}")]
    PauseFailed {
        /// Replica name.
        replica: String,
        /// Runtime error.
        source: RuntimeError,
    },

    /// Resuming a paused replica failed.
    #[error("failed to unpause replica {replica}: {source}")]
    UnpauseFailed {
        /// Replica name.
        replica: String,
        /// Runtime error.
        source: RuntimeError,
    },
}

/// Errors returned when reporting to the completion monitor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// A handle tried to send a signal of a kind it did not register for.
    #[error("signal kind mismatch: handle registered for {registered}, got {sent}")]
    KindMismatch {
        /// Kind the handle was registered with.
        registered: SignalKind,
        /// Kind that was sent.
        sent: SignalKind,
    },

    /// The monitor already resolved (or was dropped) and no longer consumes signals.
    #[error("completion monitor is no longer running")]
    Closed,
}

/// Result type alias for allocator operations.
pub type AddressResult<T> = std::result::Result<T, AddressError>;

/// Result type alias for proxy operations.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Result type alias for container runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
