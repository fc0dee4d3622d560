use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{Environment, Performance, Performer};
use crate::flow::PerformerKind;
use crate::specification::{Assertion, Slug, Thesis};

/// Checks `jsonpath` asserts against a recorded response body.
///
/// The body is the one recorded for the thesis itself or, for an
/// assertion-only thesis, the latest-declared dependency that recorded one.
#[derive(Debug, Clone, Default)]
pub struct AssertionPerformer;

impl AssertionPerformer {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// Parses the supported subset: `$`, `.field`, `['field']` and `[index]`.
fn parse_path(path: &str) -> Result<Vec<Segment>, String> {
    let invalid = || format!("invalid jsonpath `{path}`");
    let mut rest = path.trim().strip_prefix('$').ok_or_else(invalid)?;
    let mut segments = Vec::new();

    while !rest.is_empty() {
        if let Some(after_dot) = rest.strip_prefix('.') {
            let end = after_dot.find(&['.', '['][..]).unwrap_or(after_dot.len());
            let field = &after_dot[..end];
            if field.is_empty() {
                return Err(invalid());
            }
            segments.push(Segment::Field(field.to_string()));
            rest = &after_dot[end..];
        } else if let Some(after_bracket) = rest.strip_prefix('[') {
            let end = after_bracket.find(']').ok_or_else(invalid)?;
            let inner = after_bracket[..end].trim();
            let segment = if let Some(quoted) = inner
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
            {
                Segment::Field(quoted.to_string())
            } else {
                Segment::Index(inner.parse().map_err(|_| invalid())?)
            };
            segments.push(segment);
            rest = &after_bracket[end + 1..];
        } else {
            return Err(invalid());
        }
    }
    Ok(segments)
}

fn select<'a>(body: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    segments.iter().try_fold(body, |value, segment| match segment {
        Segment::Field(name) => value.get(name),
        Segment::Index(index) => value.get(*index),
    })
}

fn response_for(thesis: &Thesis, environment: &Environment) -> Option<Value> {
    environment.response(thesis.slug()).or_else(|| {
        let scenario = thesis.slug().scenario_slug().ok()?;
        thesis
            .after()
            .iter()
            .rev()
            .filter_map(|name| scenario.child(name.as_str()).ok())
            .find_map(|slug: Slug| environment.response(&slug))
    })
}

fn evaluate(assertion: &Assertion, body: &Value) -> Result<(), Performance> {
    for assert in &assertion.asserts {
        let segments = parse_path(&assert.actual).map_err(Performance::Crashed)?;
        match select(body, &segments) {
            Some(actual) if actual == &assert.expected => {}
            Some(actual) => {
                return Err(Performance::Failed(format!(
                    "`{}` is {actual}, expected {}",
                    assert.actual, assert.expected
                )))
            }
            None => {
                return Err(Performance::Failed(format!(
                    "`{}` not found in response",
                    assert.actual
                )))
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Performer for AssertionPerformer {
    fn kind(&self) -> PerformerKind {
        PerformerKind::Assertion
    }

    fn accepts(&self, thesis: &Thesis) -> bool {
        thesis.assertion().is_some()
    }

    async fn perform(&self, thesis: &Thesis, environment: &Environment) -> Performance {
        let Some(assertion) = thesis.assertion() else {
            return Performance::Crashed("thesis declares no assertion".to_string());
        };
        if assertion.method != "jsonpath" {
            return Performance::Crashed(format!(
                "assertion method `{}` is not supported",
                assertion.method
            ));
        }
        let Some(body) = response_for(thesis, environment) else {
            return Performance::Crashed("no response recorded to assert on".to_string());
        };

        debug!(slug = %thesis.slug(), asserts = assertion.asserts.len(), "Evaluating asserts");
        match evaluate(assertion, &body) {
            Ok(()) => Performance::Passed,
            Err(performance) => performance,
        }
    }
}
