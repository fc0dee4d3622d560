//! Specification model: stories, scenarios and theses.
//!
//! A [`Specification`] is produced once by [`SpecificationBuilder`] and is
//! immutable afterwards. Building validates the whole tree and reports every
//! violation at once, each tagged with the [`Slug`] of the offending node.

mod builder;
mod model;
mod slug;
mod validation;

pub use builder::{
    AssertionBuilder, HttpBuilder, ScenarioBuilder, SpecificationBuilder, StoryBuilder,
    ThesisBuilder,
};
pub use model::{
    Assert, Assertion, Http, HttpRequest, HttpResponse, Scenario, Specification,
    SpecificationParams, Stage, Statement, Story, Thesis,
};
pub use slug::{Slug, SlugError, SlugKind};
pub use validation::{
    BuildError, BuildErrors, SpecificationError, Violation, ALLOWED_ASSERTION_METHODS,
    ALLOWED_CONTENT_TYPES, ALLOWED_HTTP_METHODS,
};
