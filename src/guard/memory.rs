use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use super::{Guard, GuardError, Lease};

/// Guard for a single process.
#[derive(Debug)]
pub struct MemoryGuard {
    ttl: Duration,
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn leases(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lease>>, GuardError> {
        self.leases
            .lock()
            .map_err(|_| GuardError::Storage("lease table poisoned".to_string()))
    }
}

#[async_trait]
impl Guard for MemoryGuard {
    async fn try_acquire(&self, pipeline_id: &str) -> Result<Lease, GuardError> {
        let mut leases = self.leases()?;
        if let Some(current) = leases.get(pipeline_id) {
            if !current.is_expired() {
                return Err(current.conflict());
            }
            debug!(pipeline_id, holder = %current.holder(), "Reclaiming expired lease");
        }
        let lease = Lease::issue(pipeline_id, self.ttl);
        leases.insert(pipeline_id.to_string(), lease.clone());
        Ok(lease)
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease, GuardError> {
        let mut leases = self.leases()?;
        match leases.get_mut(lease.pipeline_id()) {
            Some(current) if current.holder() == lease.holder() => {
                *current = lease.renewed(self.ttl);
                Ok(current.clone())
            }
            _ => Err(lease.lost()),
        }
    }

    async fn release(&self, lease: Lease) -> Result<(), GuardError> {
        let mut leases = self.leases()?;
        match leases.get(lease.pipeline_id()) {
            Some(current) if current.holder() == lease.holder() => {
                leases.remove(lease.pipeline_id());
                Ok(())
            }
            _ => Err(lease.lost()),
        }
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}
