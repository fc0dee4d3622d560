//! Thesis execution capabilities.
//!
//! A [`Performer`] executes one part of a thesis (its HTTP interaction or
//! its assertion) and reports a [`Performance`]. Performers of one run share
//! an [`Environment`] so that an assertion can inspect the response the
//! HTTP performer received for the same thesis.

mod assertion;
mod http;

pub use assertion::AssertionPerformer;
pub use http::HttpPerformer;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::flow::{Event, PerformerKind};
use crate::specification::{Slug, Thesis};

/// Result of one performer on one thesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Performance {
    Passed,
    /// The thesis ran and did not hold.
    Failed(String),
    /// The thesis could not be run.
    Crashed(String),
}

impl Performance {
    pub fn event(&self) -> Event {
        match self {
            Performance::Passed => Event::Pass,
            Performance::Failed(_) => Event::Fail,
            Performance::Crashed(_) => Event::Crash,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Performance::Passed => None,
            Performance::Failed(message) | Performance::Crashed(message) => Some(message),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Performance::Passed)
    }
}

/// Per-run scratch space shared by performers.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    responses: Arc<Mutex<HashMap<Slug, Value>>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_response(&self, thesis: &Slug, body: Value) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(thesis.clone(), body);
        }
    }

    pub fn response(&self, thesis: &Slug) -> Option<Value> {
        self.responses
            .lock()
            .ok()
            .and_then(|responses| responses.get(thesis).cloned())
    }
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait Performer: Send + Sync {
    fn kind(&self) -> PerformerKind;

    /// True if the thesis declares something this performer executes.
    fn accepts(&self, thesis: &Thesis) -> bool;

    async fn perform(&self, thesis: &Thesis, environment: &Environment) -> Performance;
}

/// The HTTP performer followed by the assertion performer.
pub fn default_performers() -> Vec<Arc<dyn Performer>> {
    vec![
        Arc::new(HttpPerformer::new()),
        Arc::new(AssertionPerformer::new()),
    ]
}
