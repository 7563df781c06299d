//! Run chaos proxy routes until Ctrl-C or until a route dies.

use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use faultline_core::{shutdown, ChaosProxy};
use tokio::task::JoinSet;

use crate::config::Config;

/// Run the proxy command.
pub async fn run(config: &Config) -> Result<()> {
    if config.routes.is_empty() {
        anyhow::bail!("No [[routes]] in configuration");
    }

    let (trigger, shutdown) = shutdown::channel();
    let mut summaries = Vec::new();
    let mut routes = JoinSet::new();

    for route in &config.routes {
        let handle = ChaosProxy::listen(route.clone(), shutdown.clone())
            .await
            .with_context(|| format!("Failed to start route {}", route.listen))?;

        println!(
            "{} -> {} (delay {}-{}ms)",
            handle.local_addr(),
            route.destination,
            route.min_delay_ms,
            route.max_delay_ms
        );
        summaries.push((handle.local_addr(), route.destination.clone(), handle.metrics()));
        routes.spawn(handle.join());
    }

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping {} route(s)", summaries.len());
            Ok(())
        }
        Some(joined) = routes.join_next() => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e)),
            Err(e) => Err(anyhow::Error::new(e)),
        },
    };

    trigger.trigger();
    while routes.join_next().await.is_some() {}

    for (listen, destination, metrics) in &summaries {
        println!(
            "{} -> {}: {} connection(s), {} dial failure(s), {} bytes up, {} bytes down",
            listen,
            destination,
            metrics.connections_total.load(Ordering::Relaxed),
            metrics.dial_failures.load(Ordering::Relaxed),
            metrics.bytes_upstream.load(Ordering::Relaxed),
            metrics.bytes_downstream.load(Ordering::Relaxed)
        );
    }

    outcome.context("Route failed")
}
