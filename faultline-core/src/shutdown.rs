//! Cooperative shutdown signalling.
//!
//! A [`ShutdownTrigger`] broadcasts to any number of [`Shutdown`] receivers.
//! Dropping the trigger counts as triggering it, so tasks that outlive their
//! owner still observe the end of the run.

use tokio::sync::watch;

/// Sending side of a shutdown broadcast.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving side of a shutdown broadcast.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: Option<watch::Receiver<bool>>,
}

/// Create a connected trigger/receiver pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx: Some(rx) })
}

impl ShutdownTrigger {
    /// Notify every receiver. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`trigger`](Self::trigger) has been called.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Create another receiver for this trigger.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: Some(self.tx.subscribe()),
        }
    }
}

impl Shutdown {
    /// A receiver that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Whether shutdown has been requested (or the trigger was dropped).
    pub fn is_triggered(&self) -> bool {
        match &self.rx {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => false,
        }
    }

    /// Wait until shutdown is requested or the trigger is dropped.
    pub async fn wait(&mut self) {
        match &mut self.rx {
            // Err means the trigger was dropped, which we treat as shutdown.
            Some(rx) => {
                let _ = rx.wait_for(|triggered| *triggered).await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
