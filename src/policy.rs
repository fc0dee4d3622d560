// Persistence cadence for flow snapshots during a run.
//
// A policy drains the steps produced by one run, folds them into the flow
// and decides when the reduced snapshot is written. Saves are best effort:
// a failed save is retried, then recorded in the report, and step
// consumption carries on.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{PersistenceConfig, PolicyKind};
use crate::flow::{Flow, FlowReducer, Step};
use crate::repository::{FlowRepository, RepositoryError};

/// Upper bound of the delay between two save attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("saving flow `{flow_id}` timed out after {timeout:?}")]
    Timeout { flow_id: String, timeout: Duration },
    #[error("saving flow `{flow_id}` failed: {source}")]
    Save {
        flow_id: String,
        #[source]
        source: RepositoryError,
    },
}

/// How a single save is bounded and retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveSettings {
    pub timeout: Duration,
    pub retries: u32,
    pub base_delay: Duration,
}

impl Default for SaveSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            retries: 2,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl From<&PersistenceConfig> for SaveSettings {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.save_timeout_ms),
            retries: config.save_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }
}

/// Outcome of draining one step stream.
#[derive(Debug, Clone)]
pub struct PolicyReport {
    pub flow: Flow,
    pub steps: usize,
    pub saves: usize,
    pub failures: Vec<PolicyError>,
}

impl PolicyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[async_trait]
pub trait StepsPolicy: Send + Sync {
    /// Consumes `steps` until every sender is gone, then returns the last
    /// reduced flow together with the saves that could not be completed.
    async fn apply(&self, reducer: FlowReducer, steps: mpsc::Receiver<Step>) -> PolicyReport;
}

/// Builds the policy selected in the persistence settings.
pub fn from_config(
    config: &PersistenceConfig,
    repository: Arc<dyn FlowRepository>,
) -> Arc<dyn StepsPolicy> {
    let settings = SaveSettings::from(config);
    match config.policy {
        PolicyKind::SavePerStep => Arc::new(SavePerStepPolicy::new(repository, settings)),
        PolicyKind::Batched => Arc::new(BatchedSavePolicy::new(
            repository,
            settings,
            config.batch_size,
        )),
    }
}

#[derive(Clone)]
struct Saver {
    repository: Arc<dyn FlowRepository>,
    settings: SaveSettings,
}

impl Saver {
    /// One timed attempt plus up to `retries` more, doubling the delay up to
    /// [`MAX_RETRY_DELAY`] and adding up to half of it as jitter.
    async fn save(&self, flow: &Flow) -> Result<(), PolicyError> {
        let mut delay = self.settings.base_delay.min(MAX_RETRY_DELAY);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match tokio::time::timeout(self.settings.timeout, self.repository.save(flow))
                .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(source)) => PolicyError::Save {
                    flow_id: flow.id().to_string(),
                    source,
                },
                Err(_) => PolicyError::Timeout {
                    flow_id: flow.id().to_string(),
                    timeout: self.settings.timeout,
                },
            };

            if attempt > self.settings.retries {
                warn!(flow_id = %flow.id(), attempts = attempt, error = %error, "Giving up on flow save");
                return Err(error);
            }

            let jitter_ms = rand::rng().random_range(0..=delay.as_millis() as u64 / 2);
            debug!(
                flow_id = %flow.id(),
                attempt = attempt,
                delay_ms = delay.as_millis() as u64 + jitter_ms,
                error = %error,
                "Retrying flow save"
            );
            tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
            delay = delay.saturating_mul(2).min(MAX_RETRY_DELAY);
        }
    }
}

/// Persists the flow after every single step.
pub struct SavePerStepPolicy {
    saver: Saver,
}

impl SavePerStepPolicy {
    pub fn new(repository: Arc<dyn FlowRepository>, settings: SaveSettings) -> Self {
        Self {
            saver: Saver {
                repository,
                settings,
            },
        }
    }
}

#[async_trait]
impl StepsPolicy for SavePerStepPolicy {
    async fn apply(&self, mut reducer: FlowReducer, mut steps: mpsc::Receiver<Step>) -> PolicyReport {
        let mut report = PolicyReport {
            flow: reducer.reduce(),
            steps: 0,
            saves: 0,
            failures: Vec::new(),
        };

        while let Some(step) = steps.recv().await {
            debug!(step = %step, "Applying step");
            report.flow = reducer.with_step(&step).reduce();
            report.steps += 1;
            match self.saver.save(&report.flow).await {
                Ok(()) => report.saves += 1,
                Err(err) => report.failures.push(err),
            }
        }
        report
    }
}

/// Persists every `batch_size` steps and once more when the stream ends.
pub struct BatchedSavePolicy {
    saver: Saver,
    batch_size: usize,
}

impl BatchedSavePolicy {
    pub fn new(
        repository: Arc<dyn FlowRepository>,
        settings: SaveSettings,
        batch_size: usize,
    ) -> Self {
        Self {
            saver: Saver {
                repository,
                settings,
            },
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl StepsPolicy for BatchedSavePolicy {
    async fn apply(&self, mut reducer: FlowReducer, mut steps: mpsc::Receiver<Step>) -> PolicyReport {
        let mut report = PolicyReport {
            flow: reducer.reduce(),
            steps: 0,
            saves: 0,
            failures: Vec::new(),
        };
        let mut pending = 0;

        while let Some(step) = steps.recv().await {
            debug!(step = %step, "Applying step");
            reducer.with_step(&step);
            report.steps += 1;
            pending += 1;
            if pending < self.batch_size {
                continue;
            }
            pending = 0;
            report.flow = reducer.reduce();
            match self.saver.save(&report.flow).await {
                Ok(()) => report.saves += 1,
                Err(err) => report.failures.push(err),
            }
        }

        if pending > 0 {
            report.flow = reducer.reduce();
            match self.saver.save(&report.flow).await {
                Ok(()) => report.saves += 1,
                Err(err) => report.failures.push(err),
            }
        }
        report
    }
}
