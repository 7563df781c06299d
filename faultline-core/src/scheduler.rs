//! Chaos scheduler: pause and resume a bounded subset of a replica group.
//!
//! For each configured occurrence the scheduler waits for a free pause slot,
//! picks a random replica that is not already paused, pauses it and starts a
//! timer that resumes it after a random duration. At most
//! `max_concurrent_pauses` replicas are paused at any moment.
//!
//! Each pause runs in a detached task that owns the matching resume. The
//! resume fires on expiry, on shutdown, or when the scheduler future is
//! dropped, even if that happens while the pause call is still in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{RuntimeError, SchedulerError};
use crate::runtime::{ContainerReplica, ContainerRuntime};
use crate::shutdown::{self, Shutdown};

/// Chaos configuration for one replica group.
///
/// All fields are named and optional in configuration files; absent fields
/// take the defaults below.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChaosSpec {
    /// Upper bound on replicas paused at the same time (default: 1).
    #[serde(default = "default_max_concurrent_pauses")]
    pub max_concurrent_pauses: usize,
    /// Number of pause occurrences (default: 1).
    #[serde(default = "default_occurrences")]
    pub occurrences: usize,
    /// Shortest pause in milliseconds (default: 0).
    #[serde(default)]
    pub pause_min_ms: u64,
    /// Longest pause in milliseconds (default: 1000).
    #[serde(default = "default_pause_max_ms")]
    pub pause_max_ms: u64,
    /// Chance that an occurrence actually pauses something (default: 1.0).
    #[serde(default = "default_probability")]
    pub probability: f64,
}

fn default_max_concurrent_pauses() -> usize {
    1
}

fn default_occurrences() -> usize {
    1
}

fn default_pause_max_ms() -> u64 {
    1000
}

fn default_probability() -> f64 {
    1.0
}

impl Default for ChaosSpec {
    fn default() -> Self {
        Self {
            max_concurrent_pauses: default_max_concurrent_pauses(),
            occurrences: default_occurrences(),
            pause_min_ms: 0,
            pause_max_ms: default_pause_max_ms(),
            probability: default_probability(),
        }
    }
}

impl ChaosSpec {
    /// Short form: a fixed pause duration, always firing.
    pub fn new(max_concurrent_pauses: usize, occurrences: usize, pause_ms: u64) -> Self {
        Self {
            max_concurrent_pauses,
            occurrences,
            pause_min_ms: pause_ms,
            pause_max_ms: pause_ms,
            probability: 1.0,
        }
    }

    /// Set the pause duration bounds.
    pub fn pause_range(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.pause_min_ms = min_ms;
        self.pause_max_ms = max_ms;
        self
    }

    /// Set the per-occurrence probability.
    pub fn probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    /// Check the settings for internal consistency.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_concurrent_pauses == 0 {
            return Err(SchedulerError::InvalidSpec(
                "max_concurrent_pauses must be at least 1".into(),
            ));
        }
        if self.pause_min_ms > self.pause_max_ms {
            return Err(SchedulerError::InvalidSpec(format!(
                "pause_min_ms ({}) exceeds pause_max_ms ({})",
                self.pause_min_ms, self.pause_max_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(SchedulerError::InvalidSpec(format!(
                "probability must be within 0.0..=1.0, got {}",
                self.probability
            )));
        }
        Ok(())
    }

    fn sample_pause(&self, rng: &mut StdRng) -> Duration {
        Duration::from_millis(rng.gen_range(self.pause_min_ms..=self.pause_max_ms))
    }
}

/// Summary of a completed scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaosReport {
    /// Pauses issued.
    pub pauses: usize,
    /// Occurrences skipped by the probability roll.
    pub skipped: usize,
    /// Whether shutdown cut the run short.
    pub cancelled: bool,
}

/// Pauses and resumes replicas of one group according to a [`ChaosSpec`].
pub struct ChaosScheduler {
    runtime: Arc<dyn ContainerRuntime>,
    replicas: Vec<ContainerReplica>,
    spec: ChaosSpec,
    rng: StdRng,
}

impl std::fmt::Debug for ChaosScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosScheduler")
            .field("replicas", &self.replicas.len())
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl ChaosScheduler {
    /// Create a scheduler for a replica group.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidSpec`] for an inconsistent spec,
    /// [`SchedulerError::NoReplicas`] for an empty group.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        replicas: Vec<ContainerReplica>,
        spec: ChaosSpec,
    ) -> Result<Self, SchedulerError> {
        spec.validate()?;
        if replicas.is_empty() {
            return Err(SchedulerError::NoReplicas);
        }

        Ok(Self {
            runtime,
            replicas,
            spec,
            rng: StdRng::from_entropy(),
        })
    }

    /// Use a fixed seed for replica selection and pause durations.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// The spec this scheduler runs.
    pub fn spec(&self) -> &ChaosSpec {
        &self.spec
    }

    /// The replica group.
    pub fn replicas(&self) -> &[ContainerReplica] {
        &self.replicas
    }

    /// Run every occurrence, then wait for all paused replicas to be resumed.
    ///
    /// `shutdown` stops issuing new pauses and cuts pending pauses short.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::PauseFailed`] ends the run early (replicas already
    /// paused are resumed first). [`SchedulerError::UnpauseFailed`] is
    /// returned once every timer has finished.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<ChaosReport, SchedulerError> {
        let slots_total = self.spec.max_concurrent_pauses.min(self.replicas.len());
        let slots = Arc::new(Semaphore::new(slots_total));
        let paused = PausedSet::default();
        let (stop, stop_rx) = shutdown::channel();

        let mut report = ChaosReport::default();
        let mut timers: Vec<JoinHandle<Result<(), SchedulerError>>> = Vec::new();
        let mut outcome = Ok(());

        tracing::info!(
            "Chaos started: {} replica(s), {} occurrence(s), up to {} paused, {}-{}ms",
            self.replicas.len(),
            self.spec.occurrences,
            slots_total,
            self.spec.pause_min_ms,
            self.spec.pause_max_ms
        );

        for occurrence in 1..=self.spec.occurrences {
            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.wait() => {
                    report.cancelled = true;
                    break;
                }
            };

            if !self.rng.gen_bool(self.spec.probability) {
                tracing::debug!("Occurrence {} skipped", occurrence);
                report.skipped += 1;
                continue;
            }

            let index = paused.claim(&mut self.rng, self.replicas.len());
            let replica = self.replicas[index].clone();
            let duration = self.spec.sample_pause(&mut self.rng);

            // The pause runs inside the detached task so that dropping this
            // future mid-call still leaves a timer behind to resume it.
            let (paused_tx, paused_rx) = oneshot::channel();
            timers.push(tokio::spawn(pause_then_resume(
                self.runtime.clone(),
                replica.clone(),
                index,
                duration,
                stop_rx.clone(),
                paused.clone(),
                permit,
                paused_tx,
            )));

            match paused_rx.await {
                Ok(Ok(())) => {
                    report.pauses += 1;
                    tracing::info!(
                        "Occurrence {}: paused {} for {:?}",
                        occurrence,
                        replica.name,
                        duration
                    );
                }
                Ok(Err(source)) => {
                    tracing::error!("Failed to pause {}: {}", replica.name, source);
                    outcome = Err(SchedulerError::PauseFailed {
                        replica: replica.name,
                        source,
                    });
                    break;
                }
                Err(_) => {
                    tracing::error!("Pause task for {} ended without reporting", replica.name);
                    break;
                }
            }
        }

        if outcome.is_err() || report.cancelled {
            stop.trigger();
        }

        let mut joined = Box::pin(join_timers(timers));
        let finished = tokio::select! {
            result = &mut joined => Some(result),
            _ = shutdown.wait(), if !stop.is_triggered() => None,
        };
        let resumed = match finished {
            Some(result) => result,
            None => {
                tracing::info!("Chaos interrupted, resuming paused replicas");
                report.cancelled = true;
                stop.trigger();
                joined.await
            }
        };

        outcome?;
        resumed?;

        tracing::info!(
            "Chaos finished: {} pause(s), {} skipped{}",
            report.pauses,
            report.skipped,
            if report.cancelled { ", cancelled" } else { "" }
        );
        Ok(report)
    }
}

/// Indices of currently paused replicas.
#[derive(Debug, Default, Clone)]
struct PausedSet {
    inner: Arc<Mutex<HashSet<usize>>>,
}

impl PausedSet {
    fn lock(&self) -> MutexGuard<'_, HashSet<usize>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pick and mark a random replica that is not paused.
    ///
    /// The caller holds a pause slot and slots never exceed the group size,
    /// so at least one candidate exists.
    fn claim(&self, rng: &mut StdRng, replicas: usize) -> usize {
        let mut paused = self.lock();
        let candidates: Vec<usize> = (0..replicas).filter(|i| !paused.contains(i)).collect();
        let index = candidates[rng.gen_range(0..candidates.len())];
        paused.insert(index);
        index
    }

    fn release(&self, index: usize) {
        self.lock().remove(&index);
    }
}

/// Pause one replica, hold it for `duration`, then resume it.
///
/// The pause outcome is reported through `paused_tx`. A failed pause frees
/// the replica and its slot without an unpause.
#[allow(clippy::too_many_arguments)]
async fn pause_then_resume(
    runtime: Arc<dyn ContainerRuntime>,
    replica: ContainerReplica,
    index: usize,
    duration: Duration,
    mut stop: Shutdown,
    paused: PausedSet,
    permit: OwnedSemaphorePermit,
    paused_tx: oneshot::Sender<Result<(), RuntimeError>>,
) -> Result<(), SchedulerError> {
    if let Err(source) = runtime.pause_container(&replica.container_id).await {
        paused.release(index);
        drop(permit);
        let _ = paused_tx.send(Err(source));
        return Ok(());
    }
    // The scheduler may already be gone; the replica is resumed regardless.
    let _ = paused_tx.send(Ok(()));

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = stop.wait() => {
            tracing::debug!("Cutting pause of {} short", replica.name);
        }
    }

    let result = runtime
        .unpause_container(&replica.container_id)
        .await
        .map_err(|source| SchedulerError::UnpauseFailed {
            replica: replica.name.clone(),
            source,
        });
    match &result {
        Ok(()) => tracing::info!("Resumed {}", replica.name),
        Err(e) => tracing::error!("{}", e),
    }

    // Free the slot only once the replica is running again.
    paused.release(index);
    drop(permit);
    result
}

async fn join_timers(
    timers: Vec<JoinHandle<Result<(), SchedulerError>>>,
) -> Result<(), SchedulerError> {
    let mut first_error = None;
    for timer in timers {
        match timer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => tracing::error!("Resume timer panicked: {}", e),
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MemoryRuntime, Operation};
    use std::time::Instant;

    fn group(runtime: &MemoryRuntime, size: usize) -> Vec<ContainerReplica> {
        (0..size)
            .map(|i| {
                let name = format!("db-{}", i + 1);
                runtime.add_running(&name);
                ContainerReplica::existing(i, name)
            })
            .collect()
    }

    fn scheduler(
        runtime: &MemoryRuntime,
        size: usize,
        spec: ChaosSpec,
    ) -> ChaosScheduler {
        let replicas = group(runtime, size);
        ChaosScheduler::new(Arc::new(runtime.clone()), replicas, spec)
            .unwrap()
            .with_seed(7)
    }

    fn assert_paired(runtime: &MemoryRuntime) {
        let events = runtime.events();
        for (i, pause) in events.iter().enumerate() {
            if pause.operation != Operation::PauseContainer {
                continue;
            }
            let resumed = events[i + 1..].iter().any(|later| {
                later.operation == Operation::UnpauseContainer && later.target == pause.target
            });
            assert!(resumed, "pause of {} has no later unpause", pause.target);
        }
        assert!(runtime.paused().is_empty(), "replicas left paused");
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_cap() {
        for cap in 1..=3 {
            let runtime = MemoryRuntime::new();
            let spec = ChaosSpec::new(cap, 12, 0).pause_range(5, 20);
            let report = scheduler(&runtime, 5, spec)
                .run(Shutdown::never())
                .await
                .unwrap();

            assert_eq!(report.pauses, 12);
            assert!(runtime.max_concurrently_paused() <= cap);
            assert_paired(&runtime);
        }
    }

    #[tokio::test]
    async fn cap_larger_than_group_is_clamped() {
        let runtime = MemoryRuntime::new();
        let spec = ChaosSpec::new(10, 6, 10);
        scheduler(&runtime, 2, spec)
            .run(Shutdown::never())
            .await
            .unwrap();

        assert!(runtime.max_concurrently_paused() <= 2);
        assert_paired(&runtime);
    }

    #[tokio::test]
    async fn zero_probability_skips_every_occurrence() {
        let runtime = MemoryRuntime::new();
        let spec = ChaosSpec::new(1, 5, 10).probability(0.0);
        let report = scheduler(&runtime, 3, spec)
            .run(Shutdown::never())
            .await
            .unwrap();

        assert_eq!(report.pauses, 0);
        assert_eq!(report.skipped, 5);
        assert!(runtime.events_of(Operation::PauseContainer).is_empty());
    }

    #[tokio::test]
    async fn pause_durations_respect_bounds() {
        let runtime = MemoryRuntime::new();
        let spec = ChaosSpec::new(1, 4, 0).pause_range(40, 60);
        scheduler(&runtime, 2, spec)
            .run(Shutdown::never())
            .await
            .unwrap();

        let events = runtime.events();
        for (i, pause) in events.iter().enumerate() {
            if pause.operation != Operation::PauseContainer {
                continue;
            }
            let unpause = events[i + 1..]
                .iter()
                .find(|e| e.operation == Operation::UnpauseContainer && e.target == pause.target)
                .unwrap();
            let held = unpause.at.duration_since(pause.at);
            assert!(held >= Duration::from_millis(40), "held only {:?}", held);
            assert!(held < Duration::from_millis(60 + 500), "held {:?}", held);
        }
    }

    #[tokio::test]
    async fn shutdown_resumes_paused_replicas_promptly() {
        let runtime = MemoryRuntime::new();
        let spec = ChaosSpec::new(2, 10, 60_000);
        let (trigger, shutdown) = shutdown::channel();

        let run = tokio::spawn(scheduler(&runtime, 3, spec).run(shutdown));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.paused().len(), 2);

        let started = Instant::now();
        trigger.trigger();
        let report = run.await.unwrap().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(report.cancelled);
        assert_eq!(report.pauses, 2);
        assert_paired(&runtime);
    }

    #[tokio::test]
    async fn dropping_the_run_still_resumes() {
        let runtime = MemoryRuntime::new();
        let spec = ChaosSpec::new(1, 3, 60_000);

        let run = tokio::spawn(scheduler(&runtime, 2, spec).run(Shutdown::never()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.paused().len(), 1);

        run.abort();
        let _ = run.await;

        let deadline = Instant::now() + Duration::from_secs(2);
        while !runtime.paused().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_paired(&runtime);
    }

    /// Applies the pause, then holds the call open before returning.
    struct SlowPause {
        inner: MemoryRuntime,
        hold: Duration,
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for SlowPause {
        async fn create_container(
            &self,
            spec: &crate::runtime::ContainerSpec,
        ) -> Result<String, RuntimeError> {
            self.inner.create_container(spec).await
        }

        async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.inner.start_container(id).await
        }

        async fn pause_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.inner.pause_container(id).await?;
            tokio::time::sleep(self.hold).await;
            Ok(())
        }

        async fn unpause_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.inner.unpause_container(id).await
        }

        async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.inner.stop_container(id).await
        }

        async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.inner.remove_container(id).await
        }

        async fn list_networks(&self) -> Result<Vec<crate::runtime::NetworkInfo>, RuntimeError> {
            self.inner.list_networks().await
        }

        async fn create_network(
            &self,
            name: &str,
            subnet: &str,
            gateway: std::net::Ipv4Addr,
        ) -> Result<String, RuntimeError> {
            self.inner.create_network(name, subnet, gateway).await
        }

        async fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
            self.inner.remove_network(id).await
        }
    }

    #[tokio::test]
    async fn dropping_the_run_mid_pause_still_resumes() {
        let runtime = MemoryRuntime::new();
        let replicas = group(&runtime, 1);
        let slow = SlowPause {
            inner: runtime.clone(),
            hold: Duration::from_millis(300),
        };
        let scheduler = ChaosScheduler::new(Arc::new(slow), replicas, ChaosSpec::new(1, 1, 60_000))
            .unwrap()
            .with_seed(7);

        let run = tokio::spawn(scheduler.run(Shutdown::never()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runtime.paused(), vec!["db-1".to_string()]);

        run.abort();
        let _ = run.await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_paired(&runtime);
    }

    #[tokio::test]
    async fn pause_failure_ends_the_run() {
        let runtime = MemoryRuntime::new();
        let spec = ChaosSpec::new(2, 5, 60_000);
        let scheduler = scheduler(&runtime, 3, spec);
        runtime.fail_next(Operation::PauseContainer, "cgroup freeze failed");

        let err = scheduler.run(Shutdown::never()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::PauseFailed { .. }));
        assert!(err.to_string().contains("cgroup freeze failed"));
        assert!(runtime.paused().is_empty());
    }

    #[tokio::test]
    async fn unpause_failure_is_reported() {
        let runtime = MemoryRuntime::new();
        let spec = ChaosSpec::new(1, 1, 10);
        let scheduler = scheduler(&runtime, 1, spec);
        runtime.fail_next(Operation::UnpauseContainer, "daemon restarted");

        let err = scheduler.run(Shutdown::never()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnpauseFailed { .. }));
    }

    #[test]
    fn invalid_specs_are_rejected() {
        let runtime = MemoryRuntime::new();
        let replicas = group(&runtime, 1);
        let shared: Arc<dyn ContainerRuntime> = Arc::new(runtime);

        for spec in [
            ChaosSpec::new(0, 1, 10),
            ChaosSpec::new(1, 1, 0).pause_range(50, 10),
            ChaosSpec::new(1, 1, 10).probability(1.5),
        ] {
            let err = ChaosScheduler::new(shared.clone(), replicas.clone(), spec).unwrap_err();
            assert!(matches!(err, SchedulerError::InvalidSpec(_)));
        }

        let err = ChaosScheduler::new(shared, Vec::new(), ChaosSpec::default()).unwrap_err();
        assert!(matches!(err, SchedulerError::NoReplicas));
    }

    #[test]
    fn short_form_uses_fixed_duration() {
        let spec = ChaosSpec::new(2, 3, 500);
        assert_eq!(spec.pause_min_ms, 500);
        assert_eq!(spec.pause_max_ms, 500);
        assert_eq!(spec.probability, 1.0);
    }

    #[test]
    fn spec_fields_default_from_toml() {
        let spec: ChaosSpec = toml::from_str("max_concurrent_pauses = 2").unwrap();
        assert_eq!(spec.max_concurrent_pauses, 2);
        assert_eq!(spec.occurrences, 1);
        assert_eq!(spec.pause_max_ms, 1000);
        assert_eq!(spec.probability, 1.0);
    }
}
