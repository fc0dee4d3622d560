//! Pipeline aggregate: one run-time object bound to a specification.
//!
//! The aggregate only enforces which transitions are legal. Publishing
//! cancellation signals and enqueuing runs is left to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("pipeline `{0}` is already started")]
    AlreadyStarted(String),
    #[error("pipeline `{0}` is not started")]
    NotStarted(String),
}

/// Coarse lifecycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    Started,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    id: String,
    owner_id: String,
    specification_id: String,
    flow_id: Option<String>,
    started: bool,
    canceled: bool,
    started_by: Option<String>,
    started_at: Option<DateTime<Utc>>,
    canceled_by: Option<String>,
    canceled_at: Option<DateTime<Utc>>,
}

/// Stored representation used by repositories.
#[derive(Debug, Clone, Default)]
pub struct PipelineParams {
    pub id: String,
    pub owner_id: String,
    pub specification_id: String,
    pub flow_id: Option<String>,
    pub started: bool,
    pub canceled: bool,
    pub started_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub canceled_by: Option<String>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl Pipeline {
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        specification_id: impl Into<String>,
    ) -> Self {
        Self::unmarshal(PipelineParams {
            id: id.into(),
            owner_id: owner_id.into(),
            specification_id: specification_id.into(),
            ..PipelineParams::default()
        })
    }

    pub fn unmarshal(params: PipelineParams) -> Self {
        Self {
            id: params.id,
            owner_id: params.owner_id,
            specification_id: params.specification_id,
            flow_id: params.flow_id,
            started: params.started,
            canceled: params.canceled,
            started_by: params.started_by,
            started_at: params.started_at,
            canceled_by: params.canceled_by,
            canceled_at: params.canceled_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn specification_id(&self) -> &str {
        &self.specification_id
    }

    /// Flow of the latest run, if any run was started.
    pub fn flow_id(&self) -> Option<&str> {
        self.flow_id.as_deref()
    }

    pub fn started_by(&self) -> Option<&str> {
        self.started_by.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn canceled_by(&self) -> Option<&str> {
        self.canceled_by.as_deref()
    }

    pub fn canceled_at(&self) -> Option<DateTime<Utc>> {
        self.canceled_at
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn state(&self) -> PipelineState {
        match (self.started, self.canceled) {
            (_, true) => PipelineState::Canceled,
            (true, false) => PipelineState::Started,
            (false, false) => PipelineState::NotStarted,
        }
    }

    /// Starts the first run. A pipeline can be started only once.
    pub fn start(
        &mut self,
        flow_id: impl Into<String>,
        started_by: impl Into<String>,
    ) -> Result<(), PipelineError> {
        if self.started {
            return Err(PipelineError::AlreadyStarted(self.id.clone()));
        }
        self.mark_started(flow_id.into(), started_by.into());
        Ok(())
    }

    /// Starts again regardless of the previous state; used to resume after a
    /// crash or to rerun after a cancellation.
    pub fn restart(&mut self, flow_id: impl Into<String>, started_by: impl Into<String>) {
        self.mark_started(flow_id.into(), started_by.into());
    }

    pub fn cancel(&mut self, canceled_by: impl Into<String>) -> Result<(), PipelineError> {
        if !self.started {
            return Err(PipelineError::NotStarted(self.id.clone()));
        }
        self.canceled = true;
        self.canceled_by = Some(canceled_by.into());
        self.canceled_at = Some(Utc::now());
        Ok(())
    }

    fn mark_started(&mut self, flow_id: String, started_by: String) {
        self.started = true;
        self.canceled = false;
        self.canceled_by = None;
        self.canceled_at = None;
        self.flow_id = Some(flow_id);
        self.started_by = Some(started_by);
        self.started_at = Some(Utc::now());
    }
}
