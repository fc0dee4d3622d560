use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::guard::{Guard, GuardError, Lease};

const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

/// A lease owned by one run, renewed in the background from the moment it
/// is acquired.
///
/// Dropping it without calling [`HeldLease::release`] still releases the
/// lease on the current runtime, so a run that never gets a worker does not
/// keep its pipeline blocked until the TTL runs out.
pub(crate) struct HeldLease {
    guard: Arc<dyn Guard>,
    lease: Option<Lease>,
    heartbeat: JoinHandle<()>,
    held: watch::Receiver<bool>,
}

impl HeldLease {
    pub(crate) fn hold(guard: Arc<dyn Guard>, lease: Lease) -> Self {
        let (tx, held) = watch::channel(true);
        let heartbeat = tokio::spawn(heartbeat(guard.clone(), lease.clone(), tx));
        Self {
            guard,
            lease: Some(lease),
            heartbeat,
            held,
        }
    }

    /// Resolves once a renewal reported the lease as lost.
    pub(crate) fn watch(&self) -> LeaseWatch {
        LeaseWatch {
            held: self.held.clone(),
        }
    }

    pub(crate) async fn release(mut self) {
        self.heartbeat.abort();
        if let Some(lease) = self.lease.take() {
            release(self.guard.as_ref(), lease).await;
        }
    }
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        self.heartbeat.abort();
        let Some(lease) = self.lease.take() else {
            return;
        };
        debug!(pipeline_id = %lease.pipeline_id(), "Releasing lease of a run that did not finish");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let guard = self.guard.clone();
                runtime.spawn(async move { release(guard.as_ref(), lease).await });
            }
            Err(_) => warn!(
                pipeline_id = %lease.pipeline_id(),
                "No runtime to release lease on, it expires with its TTL"
            ),
        }
    }
}

/// Observer side of a [`HeldLease`].
#[derive(Clone)]
pub(crate) struct LeaseWatch {
    held: watch::Receiver<bool>,
}

impl LeaseWatch {
    pub(crate) fn is_lost(&self) -> bool {
        !*self.held.borrow()
    }

    pub(crate) async fn lost(&mut self) {
        if self.held.wait_for(|held| !*held).await.is_err() {
            // Heartbeat stopped without losing the lease.
            std::future::pending::<()>().await;
        }
    }
}

pub(crate) async fn release(guard: &dyn Guard, lease: Lease) {
    let pipeline_id = lease.pipeline_id().to_string();
    if let Err(err) = guard.release(lease).await {
        warn!(pipeline_id = %pipeline_id, error = %err, "Failed to release lease");
    }
}

/// Renews the lease at a third of its TTL until aborted or lost.
async fn heartbeat(guard: Arc<dyn Guard>, mut lease: Lease, held: watch::Sender<bool>) {
    let period = (guard.ttl() / 3).max(MIN_RENEW_PERIOD);
    loop {
        tokio::time::sleep(period).await;
        match guard.renew(&lease).await {
            Ok(renewed) => lease = renewed,
            Err(err @ GuardError::LeaseLost { .. }) => {
                error!(pipeline_id = %lease.pipeline_id(), error = %err, "Lease lost while running");
                let _ = held.send(false);
                return;
            }
            Err(err) => {
                warn!(pipeline_id = %lease.pipeline_id(), error = %err, "Lease renewal failed");
            }
        }
    }
}
