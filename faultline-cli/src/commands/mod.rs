//! CLI command implementations.

pub mod allocate;
pub mod chaos;
pub mod proxy;
