use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::state::{Event, State};
use crate::specification::{Scenario, Slug, SlugError, SlugKind};

/// Progress of one thesis within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThesisStatus {
    thesis_name: String,
    state: State,
    occurred_errors: Vec<String>,
}

impl ThesisStatus {
    pub fn new(thesis_name: impl Into<String>, state: State) -> Self {
        Self::with_errors(thesis_name, state, Vec::new())
    }

    pub fn with_errors(
        thesis_name: impl Into<String>,
        state: State,
        occurred_errors: Vec<String>,
    ) -> Self {
        Self {
            thesis_name: thesis_name.into(),
            state,
            occurred_errors,
        }
    }

    pub fn thesis_name(&self) -> &str {
        &self.thesis_name
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Error messages in the order they occurred.
    pub fn occurred_errors(&self) -> &[String] {
        &self.occurred_errors
    }

    pub(crate) fn apply(&mut self, event: Event, error: Option<&str>) {
        self.state = self.state.next(event);
        if let Some(error) = error {
            self.occurred_errors.push(error.to_string());
        }
    }
}

/// Progress of one scenario: its own state plus one entry per thesis.
///
/// The scenario-level state and the thesis states move independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    slug: Slug,
    state: State,
    thesis_statuses: BTreeMap<String, ThesisStatus>,
}

impl Status {
    pub fn new(
        slug: Slug,
        state: State,
        thesis_statuses: impl IntoIterator<Item = ThesisStatus>,
    ) -> Result<Self, SlugError> {
        slug.must_be(SlugKind::Scenario)?;
        Ok(Self {
            slug,
            state,
            thesis_statuses: thesis_statuses
                .into_iter()
                .map(|status| (status.thesis_name.clone(), status))
                .collect(),
        })
    }

    /// Seeds a `NotPerformed` status for every thesis of `scenario`.
    pub fn not_performed(scenario: &Scenario) -> Self {
        Self {
            slug: scenario.slug().clone(),
            state: State::NotPerformed,
            thesis_statuses: scenario
                .theses()
                .into_iter()
                .map(|thesis| {
                    let name = thesis.slug().name().to_string();
                    (name.clone(), ThesisStatus::new(name, State::NotPerformed))
                })
                .collect(),
        }
    }

    pub fn slug(&self) -> &Slug {
        &self.slug
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn thesis_status(&self, name: &str) -> Option<&ThesisStatus> {
        self.thesis_statuses.get(name)
    }

    /// Thesis statuses ordered by thesis name.
    pub fn thesis_statuses(&self) -> impl Iterator<Item = &ThesisStatus> {
        self.thesis_statuses.values()
    }

    pub(crate) fn apply(&mut self, event: Event) {
        self.state = self.state.next(event);
    }

    pub(crate) fn thesis_status_mut(&mut self, name: &str) -> Option<&mut ThesisStatus> {
        self.thesis_statuses.get_mut(name)
    }
}
