//! Error types for the harness.

use faultline_core::{AddressError, MonitorError, ProxyError, RuntimeError, SchedulerError};
use thiserror::Error;

/// Errors that can occur while orchestrating a run.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Docker API error (connection setup).
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Container engine operation failed.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Address allocation failed.
    #[error("address error: {0}")]
    Address(#[from] AddressError),

    /// Chaos scheduler could not be set up.
    #[error("chaos error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Proxy could not be started.
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Reporting to the completion monitor failed.
    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// A replica template is unusable.
    #[error("invalid replica template: {0}")]
    InvalidTemplate(String),

    /// A network name was used that this orchestrator does not know.
    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    /// An existing network has no usable IPv4 configuration.
    #[error("network {name} has no usable subnet/gateway")]
    NetworkWithoutSubnet {
        /// Network name.
        name: String,
    },
}

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;
