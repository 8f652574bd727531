//! Cooperative shutdown signal.
//!
//! A single trigger fans out to any number of listeners. Listeners that
//! subscribe after the trigger fired observe it immediately.

use tokio::sync::watch;

/// Fires the shutdown signal.
pub struct ShutdownTrigger {
    cancel: watch::Sender<bool>,
}

/// Observes the shutdown signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    cancel: watch::Receiver<bool>,
}

/// Create a connected trigger/signal pair.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (cancel, receiver) = watch::channel(false);
    (
        ShutdownTrigger { cancel },
        ShutdownSignal { cancel: receiver },
    )
}

impl ShutdownTrigger {
    /// Signal every listener to stop.
    pub fn trigger(&self) {
        self.cancel.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            cancel: self.cancel.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once shutdown was triggered or the trigger was dropped.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        let _ = cancel.wait_for(|stop| *stop).await;
    }
}
