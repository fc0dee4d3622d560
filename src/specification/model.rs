use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::slug::Slug;

/// Whole test suite: an immutable tree of stories, scenarios and theses.
///
/// Only [`SpecificationBuilder`](super::SpecificationBuilder) produces
/// validated instances. [`Specification::unmarshal`] rebuilds a stored one
/// without validating it again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    pub(crate) id: String,
    pub(crate) owner_id: String,
    pub(crate) title: String,
    pub(crate) description: String,
    pub(crate) stories: HashMap<String, Story>,
}

/// Stored representation used by repositories.
#[derive(Debug, Clone, Default)]
pub struct SpecificationParams {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub description: String,
    pub stories: Vec<Story>,
}

impl Specification {
    pub fn unmarshal(params: SpecificationParams) -> Self {
        Self {
            id: params.id,
            owner_id: params.owner_id,
            title: params.title,
            description: params.description,
            stories: params
                .stories
                .into_iter()
                .map(|story| (story.slug.name().to_string(), story))
                .collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn story(&self, name: &str) -> Option<&Story> {
        self.stories.get(name)
    }

    /// Stories ordered by slug.
    pub fn stories(&self) -> Vec<&Story> {
        let mut stories: Vec<&Story> = self.stories.values().collect();
        stories.sort_by(|a, b| a.slug.cmp(&b.slug));
        stories
    }

    /// Every scenario of every story, ordered by slug.
    pub fn scenarios(&self) -> Vec<&Scenario> {
        self.stories()
            .into_iter()
            .flat_map(|story| story.scenarios())
            .collect()
    }

    /// Looks a scenario up by its scenario slug.
    pub fn scenario(&self, slug: &Slug) -> Option<&Scenario> {
        let story = self.stories.get(slug.story_part()?)?;
        story.scenarios.get(slug.scenario_part()?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub(crate) slug: Slug,
    pub(crate) description: String,
    pub(crate) as_a: String,
    pub(crate) in_order_to: String,
    pub(crate) want_to: String,
    pub(crate) scenarios: HashMap<String, Scenario>,
}

impl Story {
    pub fn slug(&self) -> &Slug {
        &self.slug
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn as_a(&self) -> &str {
        &self.as_a
    }

    pub fn in_order_to(&self) -> &str {
        &self.in_order_to
    }

    pub fn want_to(&self) -> &str {
        &self.want_to
    }

    pub fn scenario(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.get(name)
    }

    pub fn scenarios(&self) -> Vec<&Scenario> {
        let mut scenarios: Vec<&Scenario> = self.scenarios.values().collect();
        scenarios.sort_by(|a, b| a.slug.cmp(&b.slug));
        scenarios
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub(crate) slug: Slug,
    pub(crate) description: String,
    pub(crate) theses: HashMap<String, Thesis>,
}

impl Scenario {
    pub fn slug(&self) -> &Slug {
        &self.slug
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn thesis(&self, name: &str) -> Option<&Thesis> {
        self.theses.get(name)
    }

    pub fn theses(&self) -> Vec<&Thesis> {
        let mut theses: Vec<&Thesis> = self.theses.values().collect();
        theses.sort_by(|a, b| a.slug.cmp(&b.slug));
        theses
    }
}

/// One check step: an optional HTTP interaction and an optional assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thesis {
    pub(crate) slug: Slug,
    pub(crate) after: Vec<String>,
    pub(crate) statement: Statement,
    pub(crate) http: Option<Http>,
    pub(crate) assertion: Option<Assertion>,
}

impl Thesis {
    pub fn slug(&self) -> &Slug {
        &self.slug
    }

    /// Local names of sibling theses that must finish first.
    pub fn after(&self) -> &[String] {
        &self.after
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    pub fn http(&self) -> Option<&Http> {
        self.http.as_ref()
    }

    pub fn assertion(&self) -> Option<&Assertion> {
        self.assertion.as_ref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub stage: Stage,
    pub behavior: String,
}

/// Given/when/then keyword of a thesis statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Stage {
    #[default]
    Given,
    When,
    Then,
    /// Keyword that is not recognized; rejected by validation.
    Unknown(String),
}

impl Stage {
    pub fn is_known(&self) -> bool {
        !matches!(self, Stage::Unknown(_))
    }

    pub fn keyword(&self) -> &str {
        match self {
            Stage::Given => "given",
            Stage::When => "when",
            Stage::Then => "then",
            Stage::Unknown(keyword) => keyword,
        }
    }
}

impl From<&str> for Stage {
    fn from(keyword: &str) -> Self {
        match keyword.trim().to_ascii_lowercase().as_str() {
            "given" => Stage::Given,
            "when" => Stage::When,
            "then" => Stage::Then,
            _ => Stage::Unknown(keyword.to_string()),
        }
    }
}

impl From<String> for Stage {
    fn from(keyword: String) -> Self {
        Stage::from(keyword.as_str())
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        stage.keyword().to_string()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Http {
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub allowed_codes: Vec<u16>,
    pub allowed_content_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub method: String,
    pub asserts: Vec<Assert>,
}

/// `actual` is a path into the response body, `expected` the value it must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assert {
    pub actual: String,
    pub expected: serde_json::Value,
}
