//! Pause/unpause existing containers under a monitored timeout.
//!
//! The run passes when every occurrence has been scheduled and every paused
//! container resumed before the timeout. Any proxy routes in the same config
//! file serve for the length of the run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use faultline_core::{
    ChaosProxy, ChaosScheduler, CompletionMonitor, ContainerReplica, MonitorError, SignalKind,
};
use faultline_harness::DockerRuntime;

use crate::config::Config;

/// Run the chaos command.
pub async fn run(config: &Config, seed: Option<u64>) -> Result<()> {
    let chaos = config
        .chaos
        .as_ref()
        .context("No [chaos] section in configuration")?;
    if chaos.containers.is_empty() {
        anyhow::bail!("[chaos] lists no containers");
    }
    chaos.spec.validate().context("Invalid [chaos] settings")?;

    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    let replicas = chaos
        .containers
        .iter()
        .enumerate()
        .map(|(index, name)| ContainerReplica::existing(index, name.as_str()))
        .collect();

    let mut scheduler = ChaosScheduler::new(Arc::new(runtime), replicas, chaos.spec.clone())?;
    if let Some(seed) = seed {
        scheduler = scheduler.with_seed(seed);
    }

    let mut monitor = CompletionMonitor::new();
    let finished = monitor.register_named("chaos", SignalKind::Done);
    let errors = monitor.register_named("chaos-errors", SignalKind::Error);
    let operator = monitor.register_named("operator", SignalKind::Fail);

    let mut proxies = Vec::new();
    for route in &config.routes {
        let proxy = ChaosProxy::bind(route.clone())
            .await
            .with_context(|| format!("Failed to start route {}", route.listen))?;
        let handle =
            monitor.register_named(format!("proxy-{}", proxy.local_addr()), SignalKind::Error);
        proxies.push(tokio::spawn(async move {
            if let Err(e) = proxy.serve(handle.shutdown()).await {
                deliver(handle.error(e), "proxy error after run ended");
            }
        }));
    }

    let shutdown = finished.shutdown();
    let chaos_task = tokio::spawn(async move {
        match scheduler.run(shutdown).await {
            Ok(report) => {
                println!(
                    "{} pause(s), {} skipped{}",
                    report.pauses,
                    report.skipped,
                    if report.cancelled { ", cancelled" } else { "" }
                );
                deliver(finished.done(), "chaos finished after run ended");
            }
            Err(e) => {
                deliver(errors.error(e), "chaos error after run ended");
            }
        }
    });

    let mut ended = operator.shutdown();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                deliver(operator.fail("interrupted"), "interrupt after run ended");
            }
            _ = ended.wait() => {}
        }
    });

    let verdict = monitor
        .wait(Duration::from_secs(config.run.timeout_secs))
        .await;

    // Resume every paused container before exiting.
    if let Err(e) = chaos_task.await {
        tracing::warn!("Chaos task did not finish cleanly: {}", e);
    }
    for proxy in proxies {
        if let Err(e) = proxy.await {
            tracing::warn!("Proxy task did not finish cleanly: {}", e);
        }
    }

    println!("{}", verdict);
    if !verdict.passed() {
        anyhow::bail!("Chaos run {}", verdict);
    }
    Ok(())
}

/// Log a signal the monitor no longer accepts. Returns whether it was delivered.
fn deliver(sent: std::result::Result<(), MonitorError>, what: &str) -> bool {
    match sent {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("{}: {}", what, e);
            false
        }
    }
}
