//! Completion monitor: decides when an orchestrated run ends and whether it passed.
//!
//! Participants register for exactly one [`SignalKind`] and receive a
//! [`SignalHandle`]. All handles feed one multi-producer queue of tagged
//! signals; [`CompletionMonitor::wait`] consumes it in arrival order.
//!
//! ```text
//!             Waiting
//!            /       \
//!  Error | Fail |     all expected Done
//!  timeout   |        received
//!          Failed    Succeeded
//! ```
//!
//! Succeeded and Failed are terminal. When the monitor resolves, for any
//! reason, it broadcasts "end-all" to every handle's [`Shutdown`].

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::MonitorError;
use crate::shutdown::{self, Shutdown, ShutdownTrigger};

/// Cause carried by an Error signal.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The three outcome kinds the monitor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Unexpected error; any occurrence fails the run.
    Error,
    /// Explicit semantic failure raised by test logic; any occurrence fails the run.
    Fail,
    /// One participant's successful completion.
    Done,
}

impl SignalKind {
    /// Lowercase name, used in participant labels and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Error => "error",
            SignalKind::Fail => "fail",
            SignalKind::Done => "done",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completion signal.
#[derive(Debug)]
pub enum Signal {
    /// Something went wrong.
    Error(Cause),
    /// The system under test misbehaved.
    Fail(String),
    /// The participant finished successfully.
    Done,
}

impl Signal {
    /// The kind of this signal.
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Error(_) => SignalKind::Error,
            Signal::Fail(_) => SignalKind::Fail,
            Signal::Done => SignalKind::Done,
        }
    }
}

#[derive(Debug)]
struct Envelope {
    participant: String,
    signal: Signal,
}

/// Writable end given to one registered participant.
///
/// Reporting consumes the handle, so a participant signals at most once.
/// Dropping a handle without reporting is silent.
#[derive(Debug)]
pub struct SignalHandle {
    label: String,
    kind: SignalKind,
    tx: mpsc::UnboundedSender<Envelope>,
    end_all: Shutdown,
}

impl SignalHandle {
    /// Participant label used in logs and failure reports.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Kind this handle was registered for.
    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Receiver for the monitor's end-all broadcast.
    pub fn shutdown(&self) -> Shutdown {
        self.end_all.clone()
    }

    /// Whether the monitor has already resolved.
    pub fn is_ended(&self) -> bool {
        self.end_all.is_triggered()
    }

    /// Send a signal.
    ///
    /// # Errors
    ///
    /// [`MonitorError::KindMismatch`] if `signal` is not of the registered
    /// kind, [`MonitorError::Closed`] if the monitor is no longer consuming.
    pub fn report(self, signal: Signal) -> Result<(), MonitorError> {
        if signal.kind() != self.kind {
            return Err(MonitorError::KindMismatch {
                registered: self.kind,
                sent: signal.kind(),
            });
        }

        self.tx
            .send(Envelope {
                participant: self.label,
                signal,
            })
            .map_err(|_| MonitorError::Closed)
    }

    /// Report an Error signal.
    pub fn error(self, cause: impl Into<Cause>) -> Result<(), MonitorError> {
        self.report(Signal::Error(cause.into()))
    }

    /// Report a Fail signal.
    pub fn fail(self, reason: impl Into<String>) -> Result<(), MonitorError> {
        self.report(Signal::Fail(reason.into()))
    }

    /// Report a Done signal.
    pub fn done(self) -> Result<(), MonitorError> {
        self.report(Signal::Done)
    }
}

/// Monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Still waiting for signals.
    Waiting,
    /// Every expected Done arrived with no Error or Fail.
    Succeeded,
    /// An Error, Fail or timeout ended the run.
    Failed,
}

/// Why a run failed.
#[derive(Debug)]
pub enum Failure {
    /// A participant reported an Error.
    Error {
        /// Reporting participant.
        participant: String,
        /// The reported cause.
        cause: Cause,
    },
    /// A participant reported a Fail.
    Fail {
        /// Reporting participant.
        participant: String,
        /// The reported reason.
        reason: String,
    },
    /// The timeout elapsed first.
    Timeout {
        /// The configured timeout.
        after: Duration,
        /// Done signals still outstanding.
        outstanding: usize,
    },
    /// Every handle was dropped while Done signals were still outstanding.
    Abandoned {
        /// Done signals still outstanding.
        outstanding: usize,
    },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Error { participant, cause } => {
                write!(f, "{} reported error: {}", participant, cause)
            }
            Failure::Fail {
                participant,
                reason,
            } => write!(f, "{} reported failure: {}", participant, reason),
            Failure::Timeout { after, outstanding } => write!(
                f,
                "timed out after {:?} with {} participant(s) not done",
                after, outstanding
            ),
            Failure::Abandoned { outstanding } => write!(
                f,
                "all participants went away with {} not done",
                outstanding
            ),
        }
    }
}

/// Outcome of a monitored run.
#[derive(Debug)]
pub enum Verdict {
    /// The run passed.
    Succeeded,
    /// The run failed.
    Failed(Failure),
}

impl Verdict {
    /// True only for [`Verdict::Succeeded`].
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Succeeded)
    }

    /// The terminal state this verdict corresponds to.
    pub fn state(&self) -> MonitorState {
        match self {
            Verdict::Succeeded => MonitorState::Succeeded,
            Verdict::Failed(_) => MonitorState::Failed,
        }
    }

    /// The failure, if any.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Verdict::Succeeded => None,
            Verdict::Failed(failure) => Some(failure),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Succeeded => f.write_str("passed"),
            Verdict::Failed(failure) => write!(f, "failed: {}", failure),
        }
    }
}

/// Rendezvous for every participant of one orchestrated run.
///
/// Register participants first, then call [`wait`](Self::wait) or
/// [`run`](Self::run). Independent monitors never see each other's signals.
#[derive(Debug)]
pub struct CompletionMonitor {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    end_all: ShutdownTrigger,
    end_all_rx: Shutdown,
    registered: usize,
    expected_done: usize,
}

impl Default for CompletionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionMonitor {
    /// Create a monitor with no participants.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (end_all, end_all_rx) = shutdown::channel();
        Self {
            tx,
            rx,
            end_all,
            end_all_rx,
            registered: 0,
            expected_done: 0,
        }
    }

    /// Register a participant with a generated label.
    pub fn register(&mut self, kind: SignalKind) -> SignalHandle {
        let label = format!("{}-{}", kind, self.registered + 1);
        self.register_named(label, kind)
    }

    /// Register a participant under a caller-chosen label.
    pub fn register_named(&mut self, label: impl Into<String>, kind: SignalKind) -> SignalHandle {
        self.registered += 1;
        if kind == SignalKind::Done {
            self.expected_done += 1;
        }

        let label = label.into();
        tracing::debug!("Registered participant {} ({})", label, kind);

        SignalHandle {
            label,
            kind,
            tx: self.tx.clone(),
            end_all: self.end_all_rx.clone(),
        }
    }

    /// Number of Done signals required for success.
    pub fn expected_done(&self) -> usize {
        self.expected_done
    }

    /// Number of registered participants.
    pub fn participants(&self) -> usize {
        self.registered
    }

    /// Receiver for the end-all broadcast, for components that only observe.
    pub fn end_all(&self) -> Shutdown {
        self.end_all_rx.clone()
    }

    /// Block until the run resolves, returning `true` only on success.
    pub async fn run(self, timeout: Duration) -> bool {
        self.wait(timeout).await.passed()
    }

    /// Block until the run resolves and return the detailed verdict.
    ///
    /// With no Done participants registered the run succeeds as soon as any
    /// already-queued signals have been checked for Error or Fail.
    pub async fn wait(self, timeout: Duration) -> Verdict {
        let CompletionMonitor {
            tx,
            mut rx,
            end_all,
            registered,
            expected_done,
            ..
        } = self;
        // Only handles keep the queue open from here on.
        drop(tx);

        tracing::info!(
            "Waiting on {} participant(s), {} expected done, timeout {:?}",
            registered,
            expected_done,
            timeout
        );

        let verdict = if expected_done == 0 {
            drain_queued(&mut rx)
        } else {
            consume(&mut rx, expected_done, timeout).await
        };

        end_all.trigger();
        match &verdict {
            Verdict::Succeeded => tracing::info!("Run passed"),
            Verdict::Failed(failure) => tracing::warn!("Run failed: {}", failure),
        }
        verdict
    }
}

fn drain_queued(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Verdict {
    while let Ok(envelope) = rx.try_recv() {
        if let Some(failure) = failure_of(envelope) {
            return Verdict::Failed(failure);
        }
    }
    Verdict::Succeeded
}

async fn consume(
    rx: &mut mpsc::UnboundedReceiver<Envelope>,
    expected_done: usize,
    timeout: Duration,
) -> Verdict {
    let mut outstanding = expected_done;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            envelope = rx.recv() => match envelope {
                Some(Envelope { participant, signal: Signal::Done }) => {
                    outstanding = outstanding.saturating_sub(1);
                    tracing::debug!("{} done ({} outstanding)", participant, outstanding);
                    if outstanding == 0 {
                        return Verdict::Succeeded;
                    }
                }
                Some(envelope) => {
                    if let Some(failure) = failure_of(envelope) {
                        return Verdict::Failed(failure);
                    }
                }
                None => return Verdict::Failed(Failure::Abandoned { outstanding }),
            },
            _ = &mut deadline => {
                return Verdict::Failed(Failure::Timeout { after: timeout, outstanding });
            }
        }
    }
}

fn failure_of(envelope: Envelope) -> Option<Failure> {
    let Envelope {
        participant,
        signal,
    } = envelope;
    match signal {
        Signal::Error(cause) => Some(Failure::Error { participant, cause }),
        Signal::Fail(reason) => Some(Failure::Fail {
            participant,
            reason,
        }),
        Signal::Done => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const LONG: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn succeeds_when_every_done_arrives() {
        let mut monitor = CompletionMonitor::new();
        let handles: Vec<_> = (0..3).map(|_| monitor.register(SignalKind::Done)).collect();
        assert_eq!(monitor.expected_done(), 3);

        for (i, handle) in handles.into_iter().enumerate() {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10 * i as u64)).await;
                handle.done().unwrap();
            });
        }

        assert!(monitor.run(LONG).await);
    }

    #[tokio::test]
    async fn error_short_circuits_without_waiting_for_the_rest() {
        let mut monitor = CompletionMonitor::new();
        let first = monitor.register(SignalKind::Done);
        let _slow_a = monitor.register(SignalKind::Done);
        let _slow_b = monitor.register(SignalKind::Done);
        let error = monitor.register_named("replica-probe", SignalKind::Error);

        first.done().unwrap();
        error.error("connection refused").unwrap();

        let started = Instant::now();
        let verdict = monitor.wait(LONG).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        match verdict {
            Verdict::Failed(Failure::Error { participant, cause }) => {
                assert_eq!(participant, "replica-probe");
                assert_eq!(cause.to_string(), "connection refused");
            }
            other => panic!("expected error failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fail_carries_its_reason() {
        let mut monitor = CompletionMonitor::new();
        let _done = monitor.register(SignalKind::Done);
        let fail = monitor.register(SignalKind::Fail);

        fail.fail("checksum mismatch on replica 2").unwrap();

        let verdict = monitor.wait(LONG).await;
        assert_eq!(verdict.state(), MonitorState::Failed);
        assert!(verdict
            .to_string()
            .contains("checksum mismatch on replica 2"));
    }

    #[tokio::test]
    async fn times_out_without_signals() {
        let mut monitor = CompletionMonitor::new();
        let _done = monitor.register(SignalKind::Done);

        let timeout = Duration::from_millis(200);
        let started = Instant::now();
        let verdict = monitor.wait(timeout).await;
        let elapsed = started.elapsed();

        assert!(matches!(
            verdict,
            Verdict::Failed(Failure::Timeout { outstanding: 1, .. })
        ));
        assert!(elapsed >= timeout);
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn end_all_is_broadcast_on_timeout() {
        let mut monitor = CompletionMonitor::new();
        let done = monitor.register(SignalKind::Done);
        let mut shutdown = done.shutdown();
        assert!(!done.is_ended());

        let participant = tokio::spawn(async move {
            shutdown.wait().await;
            done
        });

        assert!(!monitor.run(Duration::from_millis(50)).await);
        let done = tokio::time::timeout(Duration::from_secs(1), participant)
            .await
            .expect("participant should observe end-all")
            .unwrap();
        assert!(done.is_ended());
    }

    #[tokio::test]
    async fn signals_after_resolution_are_rejected() {
        let mut monitor = CompletionMonitor::new();
        let fail = monitor.register(SignalKind::Fail);
        let late = monitor.register(SignalKind::Done);

        fail.fail("boom").unwrap();
        assert!(!monitor.run(LONG).await);

        assert_eq!(late.done(), Err(MonitorError::Closed));
    }

    #[tokio::test]
    async fn kind_mismatch_is_rejected() {
        let mut monitor = CompletionMonitor::new();
        let done = monitor.register(SignalKind::Done);

        let err = done.fail("not allowed").unwrap_err();
        assert_eq!(
            err,
            MonitorError::KindMismatch {
                registered: SignalKind::Done,
                sent: SignalKind::Fail,
            }
        );
    }

    #[tokio::test]
    async fn no_done_participants_resolves_immediately() {
        let mut monitor = CompletionMonitor::new();
        let _observer = monitor.register(SignalKind::Error);

        assert!(monitor.run(LONG).await);
    }

    #[tokio::test]
    async fn queued_error_fails_run_without_done_participants() {
        let mut monitor = CompletionMonitor::new();
        let error = monitor.register(SignalKind::Error);
        error.error("pause failed").unwrap();

        assert!(!monitor.run(LONG).await);
    }

    #[tokio::test]
    async fn dropped_handles_abandon_the_run() {
        let mut monitor = CompletionMonitor::new();
        let done = monitor.register(SignalKind::Done);
        drop(done);

        let verdict = monitor.wait(LONG).await;
        assert!(matches!(
            verdict,
            Verdict::Failed(Failure::Abandoned { outstanding: 1 })
        ));
    }

    #[tokio::test]
    async fn independent_monitors_do_not_cross_talk() {
        let mut a = CompletionMonitor::new();
        let mut b = CompletionMonitor::new();
        let a_done = a.register(SignalKind::Done);
        let b_fail = b.register(SignalKind::Fail);
        let _b_done = b.register(SignalKind::Done);

        b_fail.fail("only b fails").unwrap();
        a_done.done().unwrap();

        assert!(a.run(LONG).await);
        assert!(!b.run(LONG).await);
    }

    #[test]
    fn generated_labels_include_kind() {
        let mut monitor = CompletionMonitor::new();
        let a = monitor.register(SignalKind::Done);
        let b = monitor.register(SignalKind::Error);
        assert_eq!(a.label(), "done-1");
        assert_eq!(b.label(), "error-2");
        assert_eq!(monitor.participants(), 2);
        assert_eq!(monitor.expected_done(), 1);
    }
}
