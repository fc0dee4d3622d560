use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

use super::model::{Assertion, Http, Scenario, Specification, Story, Thesis};
use super::slug::{Slug, SlugKind};

pub const ALLOWED_HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "TRACE", "CONNECT", "HEAD",
];

/// The empty content type means "no body".
pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "",
    "application/json",
    "application/xml",
    "text/plain",
    "text/html",
];

pub const ALLOWED_ASSERTION_METHODS: &[&str] = &["jsonpath"];

/// A single rule violated by a node of the specification tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("no stories")]
    NoStories,
    #[error("no scenarios")]
    NoScenarios,
    #[error("no theses")]
    NoTheses,
    #[error("useless thesis: neither HTTP nor assertion declared")]
    UselessThesis,
    #[error("HTTP method `{0}` is not allowed")]
    NotAllowedHttpMethod(String),
    #[error("content type `{0}` is not allowed")]
    NotAllowedContentType(String),
    #[error("assertion method `{0}` is not allowed")]
    NotAllowedAssertionMethod(String),
    #[error("unknown stage `{0}`")]
    UnknownStage(String),
    #[error("dependency `{0}` is not a thesis of this scenario")]
    UnknownDependency(String),
    #[error("cyclic dependency on `{0}`")]
    CyclicDependency(String),
    #[error("invalid name `{0}`: must be non-empty and free of `.`")]
    InvalidName(String),
}

/// A [`BuildError`] tagged with the slug of the node where it occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub slug: Slug,
    pub error: BuildError,
}

impl Violation {
    pub fn new(slug: &Slug, error: BuildError) -> Self {
        Self {
            slug: slug.clone(),
            error,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slug.kind() {
            SlugKind::Root => write!(f, "specification: {}", self.error),
            _ => write!(f, "{} `{}`: {}", self.slug.kind(), self.slug, self.error),
        }
    }
}

/// Every violation found while building one specification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildErrors {
    violations: Vec<Violation>,
}

impl BuildErrors {
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    /// True if a violation of exactly `error` is tagged with `slug`.
    pub fn contains(&self, slug: &Slug, error: &BuildError) -> bool {
        self.violations
            .iter()
            .any(|v| &v.slug == slug && &v.error == error)
    }

    pub(crate) fn push(&mut self, slug: &Slug, error: BuildError) {
        self.violations.push(Violation::new(slug, error));
    }
}

impl std::error::Error for Violation {}

impl fmt::Display for BuildErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} violation(s)", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "; {violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildErrors {}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecificationError {
    #[error("failed to build specification `{id}`: {errors}")]
    Build { id: String, errors: BuildErrors },
}

impl SpecificationError {
    pub fn build_errors(&self) -> &BuildErrors {
        match self {
            SpecificationError::Build { errors, .. } => errors,
        }
    }
}

impl Specification {
    /// Walks the whole tree and collects every violation.
    pub fn validate(&self) -> BuildErrors {
        let mut errors = BuildErrors::default();
        if self.stories.is_empty() {
            errors.push(&Slug::root(), BuildError::NoStories);
        }
        for story in self.stories() {
            story.validate_into(&mut errors);
        }
        errors
    }
}

impl Story {
    fn validate_into(&self, errors: &mut BuildErrors) {
        validate_name(&self.slug, errors);
        if self.scenarios.is_empty() {
            errors.push(&self.slug, BuildError::NoScenarios);
        }
        for scenario in self.scenarios() {
            scenario.validate_into(errors);
        }
    }
}

impl Scenario {
    fn validate_into(&self, errors: &mut BuildErrors) {
        validate_name(&self.slug, errors);
        if self.theses.is_empty() {
            errors.push(&self.slug, BuildError::NoTheses);
        }
        for thesis in self.theses() {
            thesis.validate_into(errors);
            for dependency in &thesis.after {
                if !self.theses.contains_key(dependency) {
                    errors.push(
                        &thesis.slug,
                        BuildError::UnknownDependency(dependency.clone()),
                    );
                }
            }
        }
        for name in dependency_cycles(&self.theses) {
            if let Some(thesis) = self.theses.get(&name) {
                errors.push(&thesis.slug, BuildError::CyclicDependency(name));
            }
        }
    }
}

impl Thesis {
    fn validate_into(&self, errors: &mut BuildErrors) {
        validate_name(&self.slug, errors);
        if !self.statement.stage.is_known() {
            errors.push(
                &self.slug,
                BuildError::UnknownStage(self.statement.stage.keyword().to_string()),
            );
        }
        if self.http.is_none() && self.assertion.is_none() {
            errors.push(&self.slug, BuildError::UselessThesis);
        }
        if let Some(http) = &self.http {
            validate_http(&self.slug, http, errors);
        }
        if let Some(assertion) = &self.assertion {
            validate_assertion(&self.slug, assertion, errors);
        }
    }
}

/// A name has to survive the dotted string form of its slug.
fn validate_name(slug: &Slug, errors: &mut BuildErrors) {
    let name = slug.name();
    if !Slug::is_valid_name(name) {
        errors.push(slug, BuildError::InvalidName(name.to_string()));
    }
}

fn validate_http(slug: &Slug, http: &Http, errors: &mut BuildErrors) {
    if let Some(request) = &http.request {
        if !ALLOWED_HTTP_METHODS.contains(&request.method.as_str()) {
            errors.push(slug, BuildError::NotAllowedHttpMethod(request.method.clone()));
        }
        if !ALLOWED_CONTENT_TYPES.contains(&request.content_type.as_str()) {
            errors.push(
                slug,
                BuildError::NotAllowedContentType(request.content_type.clone()),
            );
        }
    }
    if let Some(response) = &http.response {
        if !ALLOWED_CONTENT_TYPES.contains(&response.allowed_content_type.as_str()) {
            errors.push(
                slug,
                BuildError::NotAllowedContentType(response.allowed_content_type.clone()),
            );
        }
    }
}

fn validate_assertion(slug: &Slug, assertion: &Assertion, errors: &mut BuildErrors) {
    if !ALLOWED_ASSERTION_METHODS.contains(&assertion.method.as_str()) {
        errors.push(
            slug,
            BuildError::NotAllowedAssertionMethod(assertion.method.clone()),
        );
    }
}

/// Names of theses that sit on a dependency cycle, sorted.
///
/// Unknown dependencies are skipped here; they are reported separately.
fn dependency_cycles(theses: &HashMap<String, Thesis>) -> Vec<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        name: &str,
        theses: &HashMap<String, Thesis>,
        marks: &mut HashMap<String, Mark>,
        path: &mut Vec<String>,
        cyclic: &mut HashSet<String>,
    ) {
        match marks.get(name) {
            Some(Mark::Done) => return,
            Some(Mark::Visiting) => {
                if let Some(start) = path.iter().position(|n| n == name) {
                    cyclic.extend(path[start..].iter().cloned());
                }
                return;
            }
            None => {}
        }
        let Some(thesis) = theses.get(name) else {
            return;
        };
        marks.insert(name.to_string(), Mark::Visiting);
        path.push(name.to_string());
        for dependency in &thesis.after {
            visit(dependency, theses, marks, path, cyclic);
        }
        path.pop();
        marks.insert(name.to_string(), Mark::Done);
    }

    let mut marks = HashMap::new();
    let mut cyclic = HashSet::new();
    let mut names: Vec<&String> = theses.keys().collect();
    names.sort();
    for name in names {
        visit(name, theses, &mut marks, &mut Vec::new(), &mut cyclic);
    }
    let mut cyclic: Vec<String> = cyclic.into_iter().collect();
    cyclic.sort();
    cyclic
}
