// Fluent builders for the specification tree.
//
// Each parent stores its children as deferred build functions. They run at
// `build` time, bottom-up, with the slug derived from the parent.

use std::collections::HashMap;

use super::model::{
    Assert, Assertion, Http, HttpRequest, HttpResponse, Scenario, Specification, Stage, Statement,
    Story, Thesis,
};
use super::slug::{Slug, SlugKind};
use super::validation::SpecificationError;

type BuildFn<T> = Box<dyn FnOnce(&Slug) -> T + Send>;

/// Slug kinds are decided structurally, so a mismatch is a bug in the caller.
fn expect_kind(slug: &Slug, kind: SlugKind) {
    if let Err(err) = slug.must_be(kind) {
        panic!("{err}");
    }
}

fn child_slug(parent: &Slug, name: &str) -> Slug {
    match parent.child(name) {
        Ok(slug) => slug,
        Err(err) => panic!("{err}"),
    }
}

#[derive(Default)]
pub struct SpecificationBuilder {
    id: String,
    owner_id: String,
    title: String,
    description: String,
    stories: Vec<(String, BuildFn<Story>)>,
}

impl SpecificationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_story<F>(mut self, name: impl Into<String>, configure: F) -> Self
    where
        F: FnOnce(&mut StoryBuilder) + Send + 'static,
    {
        self.stories.push((
            name.into(),
            Box::new(move |slug| {
                let mut builder = StoryBuilder::default();
                configure(&mut builder);
                builder.build(slug)
            }),
        ));
        self
    }

    /// Builds the tree and validates it as a whole.
    ///
    /// All violations are reported together; a specification is returned
    /// only if there are none.
    pub fn build(self) -> Result<Specification, SpecificationError> {
        let root = Slug::root();
        let stories: HashMap<String, Story> = self
            .stories
            .into_iter()
            .map(|(name, build)| {
                let story = build(&child_slug(&root, &name));
                (name, story)
            })
            .collect();

        let specification = Specification {
            id: self.id,
            owner_id: self.owner_id,
            title: self.title,
            description: self.description,
            stories,
        };

        let errors = specification.validate();
        if !errors.is_empty() {
            return Err(SpecificationError::Build {
                id: specification.id,
                errors,
            });
        }
        Ok(specification)
    }
}

#[derive(Default)]
pub struct StoryBuilder {
    description: String,
    as_a: String,
    in_order_to: String,
    want_to: String,
    scenarios: Vec<(String, BuildFn<Scenario>)>,
}

impl StoryBuilder {
    pub fn with_description(&mut self, description: impl Into<String>) -> &mut Self {
        self.description = description.into();
        self
    }

    pub fn with_as_a(&mut self, as_a: impl Into<String>) -> &mut Self {
        self.as_a = as_a.into();
        self
    }

    pub fn with_in_order_to(&mut self, in_order_to: impl Into<String>) -> &mut Self {
        self.in_order_to = in_order_to.into();
        self
    }

    pub fn with_want_to(&mut self, want_to: impl Into<String>) -> &mut Self {
        self.want_to = want_to.into();
        self
    }

    pub fn with_scenario<F>(&mut self, name: impl Into<String>, configure: F) -> &mut Self
    where
        F: FnOnce(&mut ScenarioBuilder) + Send + 'static,
    {
        self.scenarios.push((
            name.into(),
            Box::new(move |slug| {
                let mut builder = ScenarioBuilder::default();
                configure(&mut builder);
                builder.build(slug)
            }),
        ));
        self
    }

    /// # Panics
    ///
    /// If `slug` is not a story slug.
    pub fn build(self, slug: &Slug) -> Story {
        expect_kind(slug, SlugKind::Story);
        let scenarios = self
            .scenarios
            .into_iter()
            .map(|(name, build)| {
                let scenario = build(&child_slug(slug, &name));
                (name, scenario)
            })
            .collect();

        Story {
            slug: slug.clone(),
            description: self.description,
            as_a: self.as_a,
            in_order_to: self.in_order_to,
            want_to: self.want_to,
            scenarios,
        }
    }
}

#[derive(Default)]
pub struct ScenarioBuilder {
    description: String,
    theses: Vec<(String, BuildFn<Thesis>)>,
}

impl ScenarioBuilder {
    pub fn with_description(&mut self, description: impl Into<String>) -> &mut Self {
        self.description = description.into();
        self
    }

    pub fn with_thesis<F>(&mut self, name: impl Into<String>, configure: F) -> &mut Self
    where
        F: FnOnce(&mut ThesisBuilder) + Send + 'static,
    {
        self.theses.push((
            name.into(),
            Box::new(move |slug| {
                let mut builder = ThesisBuilder::default();
                configure(&mut builder);
                builder.build(slug)
            }),
        ));
        self
    }

    /// # Panics
    ///
    /// If `slug` is not a scenario slug.
    pub fn build(self, slug: &Slug) -> Scenario {
        expect_kind(slug, SlugKind::Scenario);
        let theses = self
            .theses
            .into_iter()
            .map(|(name, build)| {
                let thesis = build(&child_slug(slug, &name));
                (name, thesis)
            })
            .collect();

        Scenario {
            slug: slug.clone(),
            description: self.description,
            theses,
        }
    }
}

#[derive(Default)]
pub struct ThesisBuilder {
    after: Vec<String>,
    statement: Statement,
    http: Option<Http>,
    assertion: Option<Assertion>,
}

impl ThesisBuilder {
    pub fn with_dependency(&mut self, after: impl Into<String>) -> &mut Self {
        self.after.push(after.into());
        self
    }

    pub fn with_statement(
        &mut self,
        stage: impl Into<String>,
        behavior: impl Into<String>,
    ) -> &mut Self {
        self.statement = Statement {
            stage: Stage::from(stage.into()),
            behavior: behavior.into(),
        };
        self
    }

    pub fn with_http<F>(&mut self, configure: F) -> &mut Self
    where
        F: FnOnce(&mut HttpBuilder),
    {
        let mut builder = HttpBuilder::default();
        configure(&mut builder);
        self.http = Some(builder.build());
        self
    }

    pub fn with_assertion<F>(&mut self, configure: F) -> &mut Self
    where
        F: FnOnce(&mut AssertionBuilder),
    {
        let mut builder = AssertionBuilder::default();
        configure(&mut builder);
        self.assertion = Some(builder.build());
        self
    }

    /// # Panics
    ///
    /// If `slug` is not a thesis slug.
    pub fn build(self, slug: &Slug) -> Thesis {
        expect_kind(slug, SlugKind::Thesis);
        Thesis {
            slug: slug.clone(),
            after: self.after,
            statement: self.statement,
            http: self.http,
            assertion: self.assertion,
        }
    }
}

#[derive(Default)]
pub struct HttpBuilder {
    request: Option<HttpRequest>,
    response: Option<HttpResponse>,
}

impl HttpBuilder {
    pub fn with_request(
        &mut self,
        method: impl Into<String>,
        url: impl Into<String>,
    ) -> &mut Self {
        let request = self.request.get_or_insert_with(HttpRequest::default);
        request.method = method.into().trim().to_ascii_uppercase();
        request.url = url.into();
        self
    }

    pub fn with_request_content_type(&mut self, content_type: impl Into<String>) -> &mut Self {
        self.request
            .get_or_insert_with(HttpRequest::default)
            .content_type = content_type.into();
        self
    }

    pub fn with_request_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.request
            .get_or_insert_with(HttpRequest::default)
            .headers
            .insert(name.into(), value.into());
        self
    }

    pub fn with_request_body(&mut self, body: serde_json::Value) -> &mut Self {
        self.request.get_or_insert_with(HttpRequest::default).body = Some(body);
        self
    }

    pub fn with_response(
        &mut self,
        allowed_codes: impl IntoIterator<Item = u16>,
        allowed_content_type: impl Into<String>,
    ) -> &mut Self {
        self.response = Some(HttpResponse {
            allowed_codes: allowed_codes.into_iter().collect(),
            allowed_content_type: allowed_content_type.into(),
        });
        self
    }

    fn build(self) -> Http {
        Http {
            request: self.request,
            response: self.response,
        }
    }
}

#[derive(Default)]
pub struct AssertionBuilder {
    method: String,
    asserts: Vec<Assert>,
}

impl AssertionBuilder {
    pub fn with_method(&mut self, method: impl Into<String>) -> &mut Self {
        self.method = method.into().trim().to_ascii_lowercase();
        self
    }

    pub fn with_assert(
        &mut self,
        actual: impl Into<String>,
        expected: serde_json::Value,
    ) -> &mut Self {
        self.asserts.push(Assert {
            actual: actual.into(),
            expected,
        });
        self
    }

    fn build(self) -> Assertion {
        Assertion {
            method: self.method,
            asserts: self.asserts,
        }
    }
}
