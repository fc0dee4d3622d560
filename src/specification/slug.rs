use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SEPARATOR: char = '.';

/// Structural kind of a [`Slug`], derived from how many parts it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlugKind {
    /// No parts: addresses the specification itself.
    Root,
    Story,
    Scenario,
    Thesis,
}

impl fmt::Display for SlugKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlugKind::Root => "root",
            SlugKind::Story => "story",
            SlugKind::Scenario => "scenario",
            SlugKind::Thesis => "thesis",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlugError {
    #[error("slug `{slug}` is a {actual} slug, expected {expected}")]
    WrongKind {
        slug: Slug,
        expected: SlugKind,
        actual: SlugKind,
    },
    #[error("slug `{0}` has too many parts")]
    TooManyParts(String),
    #[error("slug `{0}` has an empty part")]
    EmptyPart(String),
}

/// Hierarchical address of a node: `story`, `story.scenario` or
/// `story.scenario.thesis`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slug {
    parts: Vec<String>,
}

impl Slug {
    pub fn root() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn story(story: impl Into<String>) -> Self {
        Self {
            parts: vec![story.into()],
        }
    }

    pub fn scenario(story: impl Into<String>, scenario: impl Into<String>) -> Self {
        Self {
            parts: vec![story.into(), scenario.into()],
        }
    }

    pub fn thesis(
        story: impl Into<String>,
        scenario: impl Into<String>,
        thesis: impl Into<String>,
    ) -> Self {
        Self {
            parts: vec![story.into(), scenario.into(), thesis.into()],
        }
    }

    pub fn kind(&self) -> SlugKind {
        match self.parts.len() {
            0 => SlugKind::Root,
            1 => SlugKind::Story,
            2 => SlugKind::Scenario,
            _ => SlugKind::Thesis,
        }
    }

    /// True for names that keep their slug intact in its string form.
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty() && !name.contains(SEPARATOR)
    }

    /// Slug of a direct child named `name`.
    ///
    /// Fails on thesis slugs, which are leaves.
    pub fn child(&self, name: impl Into<String>) -> Result<Slug, SlugError> {
        if self.kind() == SlugKind::Thesis {
            return Err(SlugError::TooManyParts(format!("{self}{SEPARATOR}{}", name.into())));
        }
        let mut parts = self.parts.clone();
        parts.push(name.into());
        Ok(Self { parts })
    }

    /// Returns `Ok(())` when the slug has the `expected` kind.
    pub fn must_be(&self, expected: SlugKind) -> Result<(), SlugError> {
        let actual = self.kind();
        if actual != expected {
            return Err(SlugError::WrongKind {
                slug: self.clone(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    pub fn story_part(&self) -> Option<&str> {
        self.parts.first().map(String::as_str)
    }

    pub fn scenario_part(&self) -> Option<&str> {
        self.parts.get(1).map(String::as_str)
    }

    pub fn thesis_part(&self) -> Option<&str> {
        self.parts.get(2).map(String::as_str)
    }

    /// Local name of the addressed node; empty for the root slug.
    pub fn name(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or_default()
    }

    /// Scenario slug owning this thesis slug.
    pub fn scenario_slug(&self) -> Result<Slug, SlugError> {
        self.must_be(SlugKind::Thesis)?;
        Ok(Self {
            parts: self.parts[..2].to_vec(),
        })
    }

    /// Story slug owning this scenario or thesis slug.
    pub fn story_slug(&self) -> Result<Slug, SlugError> {
        match self.kind() {
            SlugKind::Scenario | SlugKind::Thesis => Ok(Self {
                parts: self.parts[..1].to_vec(),
            }),
            actual => Err(SlugError::WrongKind {
                slug: self.clone(),
                expected: SlugKind::Scenario,
                actual,
            }),
        }
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, "{SEPARATOR}")?;
            }
            f.write_str(part)?;
        }
        Ok(())
    }
}

impl FromStr for Slug {
    type Err = SlugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let parts: Vec<String> = s.split(SEPARATOR).map(str::to_string).collect();
        if parts.len() > 3 {
            return Err(SlugError::TooManyParts(s.to_string()));
        }
        if parts.iter().any(String::is_empty) {
            return Err(SlugError::EmptyPart(s.to_string()));
        }
        Ok(Self { parts })
    }
}

impl TryFrom<String> for Slug {
    type Error = SlugError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Slug> for String {
    fn from(slug: Slug) -> Self {
        slug.to_string()
    }
}
