//! Run progress ("flow") of a pipeline.
//!
//! A [`Flow`] is a snapshot: one [`Status`] per scenario, each with one
//! [`ThesisStatus`] per thesis, plus the overall [`State`] derived from the
//! scenario states. [`FlowReducer`] seeds a flow from a specification or
//! from stored statuses and folds [`Step`]s into it.

mod state;
mod status;
mod step;

pub use state::{Event, State};
pub use status::{Status, ThesisStatus};
pub use step::{PerformerKind, Step};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::specification::{Slug, Specification};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    id: String,
    pipeline_id: String,
    statuses: Vec<Status>,
    state: State,
}

/// Stored representation of a flow. Missing statuses are tolerated.
#[derive(Debug, Clone, Default)]
pub struct FlowParams {
    pub id: String,
    pub pipeline_id: String,
    pub statuses: Vec<Option<Status>>,
}

impl Flow {
    pub fn unmarshal(params: FlowParams) -> Self {
        Self::from_parts(
            params.id,
            params.pipeline_id,
            params.statuses.into_iter().flatten().collect(),
        )
    }

    fn from_parts(id: String, pipeline_id: String, statuses: Vec<Status>) -> Self {
        let state = State::overall(statuses.iter().map(Status::state));
        Self {
            id,
            pipeline_id,
            statuses,
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn statuses(&self) -> &[Status] {
        &self.statuses
    }

    pub fn status(&self, slug: &Slug) -> Option<&Status> {
        self.statuses.iter().find(|status| status.slug() == slug)
    }

    /// Highest-precedence scenario state.
    pub fn state(&self) -> State {
        self.state
    }

    /// True once no scenario and no thesis is waiting or in progress.
    pub fn is_finished(&self) -> bool {
        self.statuses.iter().all(|status| {
            status.state().is_finished()
                && status
                    .thesis_statuses()
                    .all(|thesis| thesis.state().is_finished())
        })
    }
}

/// Folds steps into a flow.
///
/// Applying a step only touches the dimension it addresses: a thesis step
/// never changes its scenario's own state and a scenario step never changes
/// thesis states.
#[derive(Debug, Clone)]
pub struct FlowReducer {
    id: String,
    pipeline_id: String,
    statuses: Vec<Status>,
    positions: HashMap<Slug, usize>,
}

impl FlowReducer {
    /// Fresh progress: every scenario and thesis `NotPerformed`.
    pub fn from_specification(
        id: impl Into<String>,
        pipeline_id: impl Into<String>,
        specification: &Specification,
    ) -> Self {
        let statuses = specification
            .scenarios()
            .into_iter()
            .map(Status::not_performed)
            .collect();
        Self::new(id.into(), pipeline_id.into(), statuses)
    }

    /// Resumes from stored statuses. `None` entries are dropped.
    pub fn from_statuses(
        id: impl Into<String>,
        pipeline_id: impl Into<String>,
        statuses: impl IntoIterator<Item = Option<Status>>,
    ) -> Self {
        Self::new(
            id.into(),
            pipeline_id.into(),
            statuses.into_iter().flatten().collect(),
        )
    }

    pub fn from_flow(flow: &Flow) -> Self {
        Self::new(flow.id.clone(), flow.pipeline_id.clone(), flow.statuses.clone())
    }

    fn new(id: String, pipeline_id: String, statuses: Vec<Status>) -> Self {
        let positions = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| (status.slug().clone(), i))
            .collect();
        Self {
            id,
            pipeline_id,
            statuses,
            positions,
        }
    }

    pub fn with_step(&mut self, step: &Step) -> &mut Self {
        match step {
            Step::Thesis {
                slug, event, error, ..
            } => {
                let thesis = slug
                    .scenario_slug()
                    .ok()
                    .and_then(|scenario| self.positions.get(&scenario).copied())
                    .and_then(|i| self.statuses[i].thesis_status_mut(slug.name()));
                match thesis {
                    Some(thesis) => thesis.apply(*event, error.as_deref()),
                    None => warn!(slug = %slug, event = %event, "Step addresses unknown thesis"),
                }
            }
            Step::Scenario { slug, event, .. } => match self.positions.get(slug) {
                Some(&i) => self.statuses[i].apply(*event),
                None => warn!(slug = %slug, event = %event, "Step addresses unknown scenario"),
            },
        }
        self
    }

    pub fn with_steps<'a>(&mut self, steps: impl IntoIterator<Item = &'a Step>) -> &mut Self {
        for step in steps {
            self.with_step(step);
        }
        self
    }

    /// Current status of a scenario, without taking a snapshot.
    pub fn status(&self, slug: &Slug) -> Option<&Status> {
        self.positions.get(slug).map(|&i| &self.statuses[i])
    }

    /// Current status of the thesis named by a thesis slug.
    pub fn thesis_status(&self, slug: &Slug) -> Option<&ThesisStatus> {
        let scenario = slug.scenario_slug().ok()?;
        self.status(&scenario)?.thesis_status(slug.name())
    }

    /// Snapshot of the current progress.
    pub fn reduce(&self) -> Flow {
        Flow::from_parts(
            self.id.clone(),
            self.pipeline_id.clone(),
            self.statuses.clone(),
        )
    }
}
