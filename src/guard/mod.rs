//! Mutual exclusion of pipeline runs.
//!
//! A [`Guard`] hands out at most one live [`Lease`] per pipeline id. Leases
//! expire after a TTL unless renewed, so a holder that crashed without
//! releasing does not block the pipeline forever.

mod file;
mod memory;

pub use file::FileGuard;
pub use memory::MemoryGuard;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("pipeline `{pipeline_id}` is already acquired by {holder}")]
    AlreadyAcquired { pipeline_id: String, holder: String },
    #[error("lease of pipeline `{pipeline_id}` is no longer held by {holder}")]
    LeaseLost { pipeline_id: String, holder: String },
    #[error("guard storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for GuardError {
    fn from(err: std::io::Error) -> Self {
        GuardError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        GuardError::Storage(err.to_string())
    }
}

/// Exclusive execution right for one pipeline id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pipeline_id: String,
    holder: String,
    expires_at: DateTime<Utc>,
}

impl Lease {
    pub(crate) fn issue(pipeline_id: &str, ttl: Duration) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            holder: holder_id(),
            expires_at: expiry(ttl),
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// `hostname:pid:uuid` of the process that acquired the lease.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    pub(crate) fn renewed(&self, ttl: Duration) -> Self {
        Self {
            expires_at: expiry(ttl),
            ..self.clone()
        }
    }

    pub(crate) fn lost(&self) -> GuardError {
        GuardError::LeaseLost {
            pipeline_id: self.pipeline_id.clone(),
            holder: self.holder.clone(),
        }
    }

    pub(crate) fn conflict(&self) -> GuardError {
        GuardError::AlreadyAcquired {
            pipeline_id: self.pipeline_id.clone(),
            holder: self.holder.clone(),
        }
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
    Utc::now() + ttl
}

fn holder_id() -> String {
    let host = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    format!("{host}:{}:{}", std::process::id(), Uuid::new_v4())
}

#[async_trait]
pub trait Guard: Send + Sync {
    /// Fails fast with [`GuardError::AlreadyAcquired`] while another live
    /// lease exists.
    async fn try_acquire(&self, pipeline_id: &str) -> Result<Lease, GuardError>;

    /// Extends the lease by one TTL.
    async fn renew(&self, lease: &Lease) -> Result<Lease, GuardError>;

    async fn release(&self, lease: Lease) -> Result<(), GuardError>;

    /// Lease duration; holders renew well before it runs out.
    fn ttl(&self) -> Duration;
}
