use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::model::WatchedDevice;
use crate::subscription::{SubscriptionManager, SubscriptionOutcome};

/// Resolves on the first SIGINT (Ctrl+C) or, on Unix, SIGTERM.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(err) = res {
                            error!("Failed to listen for Ctrl+C: {}", err);
                            std::future::pending::<()>().await;
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => error!("Failed to install SIGTERM handler: {}", err),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", err);
        std::future::pending::<()>().await;
    }
}

/// Resolves on a further Ctrl+C. Never resolves if the listener cannot be installed.
pub async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    TimedOut { pending: usize },
    Interrupted { pending: usize },
}

/// Closes `tracker` and waits up to `grace` for its tasks. `interrupt` resolving cuts the wait short.
pub async fn drain(
    tracker: &TaskTracker,
    grace: Duration,
    interrupt: impl Future<Output = ()>,
) -> DrainOutcome {
    tracker.close();
    let outcome = tokio::select! {
        res = timeout(grace, tracker.wait()) => match res {
            Ok(()) => DrainOutcome::Drained,
            Err(_) => DrainOutcome::TimedOut { pending: tracker.len() },
        },
        _ = interrupt => DrainOutcome::Interrupted { pending: tracker.len() },
    };
    match outcome {
        DrainOutcome::Drained => {}
        DrainOutcome::TimedOut { pending } => warn!(
            pending,
            grace_ms = grace.as_millis() as u64,
            "exiting with requests still in flight"
        ),
        DrainOutcome::Interrupted { pending } => {
            warn!(pending, "interrupted again; exiting without waiting")
        }
    }
    outcome
}

/// Revokes every watched device's subscription once the process is told to stop.
pub struct ShutdownCoordinator {
    subscriptions: SubscriptionManager,
    devices: Vec<WatchedDevice>,
    revoked: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(subscriptions: SubscriptionManager, devices: Vec<WatchedDevice>) -> Self {
        ShutdownCoordinator {
            subscriptions,
            devices,
            revoked: AtomicBool::new(false),
        }
    }

    /// Fires one unsubscribe per device without waiting for responses. A second call is a no-op.
    pub fn revoke_all(&self) -> Vec<JoinHandle<SubscriptionOutcome>> {
        if self.revoked.swap(true, Ordering::SeqCst) {
            info!(target: "loka_subscription", "subscriptions already revoked");
            return Vec::new();
        }
        self.subscriptions.unsubscribe_all(&self.devices)
    }
}
