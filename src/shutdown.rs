//! Graceful shutdown coordination.
//!
//! A [`Shutdown`] is the trigger side; every long-running task holds a
//! [`ShutdownSignal`] and checks it at its suspension points. The flag is
//! sticky: a task that subscribes after the trigger still sees it.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` before sending SIGKILL. Wire
//! [`Shutdown::trigger_on_os_signal`] into the listen options and the
//! application stops accepting, finishes the requests in flight, then
//! returns from `listen`.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

/// Trigger side of the shutdown flag. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// A receiver that resolves once [`trigger`](Shutdown::trigger) is called.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Spawns a task that triggers this shutdown on the first SIGTERM or
    /// Ctrl-C the process receives.
    pub fn trigger_on_os_signal(&self) -> &Self {
        let shutdown = self.clone();
        tokio::spawn(async move {
            os_signal().await;
            info!("shutdown signal received");
            shutdown.trigger();
        });
        self
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`Shutdown`].
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been triggered. Never resolves if every
    /// [`Shutdown`] handle was dropped without triggering.
    pub async fn recv(&mut self) {
        if self.rx.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** and **SIGINT** (Ctrl-C).
/// On Windows only Ctrl-C is available. A handler that cannot be installed
/// is logged and never fires.
async fn os_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscribers_see_the_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut signal = shutdown.subscribe();
        assert!(signal.is_triggered());
        signal.recv().await;
    }

    #[tokio::test]
    async fn dropped_trigger_never_fires() {
        let mut signal = Shutdown::new().subscribe();
        let fired = tokio::time::timeout(std::time::Duration::from_millis(20), signal.recv()).await;
        assert!(fired.is_err());
    }
}
