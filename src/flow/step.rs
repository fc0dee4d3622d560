use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::Event;
use crate::specification::{Slug, SlugError, SlugKind};

/// Execution capability that produced a thesis step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformerKind {
    Http,
    Assertion,
}

impl fmt::Display for PerformerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerformerKind::Http => f.write_str("HTTP performer"),
            PerformerKind::Assertion => f.write_str("assertion performer"),
        }
    }
}

/// One unit of progress: an event addressed to a thesis or to a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Thesis {
        slug: Slug,
        event: Event,
        performer: Option<PerformerKind>,
        error: Option<String>,
    },
    Scenario {
        slug: Slug,
        event: Event,
        error: Option<String>,
    },
}

impl Step {
    pub fn thesis(slug: Slug, event: Event) -> Result<Self, SlugError> {
        slug.must_be(SlugKind::Thesis)?;
        Ok(Step::Thesis {
            slug,
            event,
            performer: None,
            error: None,
        })
    }

    pub fn scenario(slug: Slug, event: Event) -> Result<Self, SlugError> {
        slug.must_be(SlugKind::Scenario)?;
        Ok(Step::Scenario {
            slug,
            event,
            error: None,
        })
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        match &mut self {
            Step::Thesis { error, .. } | Step::Scenario { error, .. } => {
                *error = Some(message.into());
            }
        }
        self
    }

    /// Tags a thesis step with the performer that produced it.
    pub fn with_performer(mut self, kind: PerformerKind) -> Self {
        if let Step::Thesis { performer, .. } = &mut self {
            *performer = Some(kind);
        }
        self
    }

    pub fn slug(&self) -> &Slug {
        match self {
            Step::Thesis { slug, .. } | Step::Scenario { slug, .. } => slug,
        }
    }

    pub fn event(&self) -> Event {
        match self {
            Step::Thesis { event, .. } | Step::Scenario { event, .. } => *event,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Step::Thesis { error, .. } | Step::Scenario { error, .. } => error.as_deref(),
        }
    }

    pub fn performer(&self) -> Option<PerformerKind> {
        match self {
            Step::Thesis { performer, .. } => *performer,
            Step::Scenario { .. } => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} `{}` <- {}", self.slug().kind(), self.slug(), self.event())?;
        if let Some(performer) = self.performer() {
            write!(f, " by {performer}")?;
        }
        if let Some(error) = self.error() {
            write!(f, ": {error}")?;
        }
        Ok(())
    }
}
