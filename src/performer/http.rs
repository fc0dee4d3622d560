use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{Environment, Performance, Performer};
use crate::flow::PerformerKind;
use crate::specification::{HttpRequest, HttpResponse, Thesis};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends the request declared by a thesis and checks the response envelope.
///
/// The response body is recorded in the environment, parsed as JSON when
/// possible and as a JSON string otherwise.
#[derive(Debug, Clone)]
pub struct HttpPerformer {
    client: Client,
}

impl HttpPerformer {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn request(&self, spec: &HttpRequest) -> Result<reqwest::RequestBuilder, String> {
        let method = Method::from_bytes(spec.method.as_bytes())
            .map_err(|_| format!("invalid HTTP method `{}`", spec.method))?;
        let mut request = self.client.request(method, &spec.url);

        for (name, value) in &spec.headers {
            request = request.header(name, value);
        }
        if !spec.content_type.is_empty() {
            request = request.header(CONTENT_TYPE, &spec.content_type);
        }
        if let Some(body) = &spec.body {
            request = match body {
                Value::String(text) if spec.content_type != "application/json" => {
                    request.body(text.clone())
                }
                _ => request.body(body.to_string()),
            };
        }
        Ok(request)
    }
}

impl Default for HttpPerformer {
    fn default() -> Self {
        Self::new()
    }
}

fn check_envelope(
    expected: &HttpResponse,
    status: u16,
    content_type: Option<&str>,
) -> Result<(), String> {
    if !expected.allowed_codes.is_empty() && !expected.allowed_codes.contains(&status) {
        return Err(format!(
            "unexpected status code {status}, allowed {:?}",
            expected.allowed_codes
        ));
    }
    if !expected.allowed_content_type.is_empty() {
        let actual = content_type.unwrap_or_default();
        let media_type = actual.split(';').next().unwrap_or_default().trim();
        if !media_type.eq_ignore_ascii_case(&expected.allowed_content_type) {
            return Err(format!(
                "unexpected content type `{actual}`, allowed `{}`",
                expected.allowed_content_type
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl Performer for HttpPerformer {
    fn kind(&self) -> PerformerKind {
        PerformerKind::Http
    }

    fn accepts(&self, thesis: &Thesis) -> bool {
        thesis.http().is_some_and(|http| http.request.is_some())
    }

    async fn perform(&self, thesis: &Thesis, environment: &Environment) -> Performance {
        let Some(http) = thesis.http() else {
            return Performance::Crashed("thesis declares no HTTP interaction".to_string());
        };
        let Some(spec) = &http.request else {
            return Performance::Crashed("thesis declares no HTTP request".to_string());
        };

        let request = match self.request(spec) {
            Ok(request) => request,
            Err(message) => return Performance::Crashed(message),
        };
        debug!(slug = %thesis.slug(), method = %spec.method, url = %spec.url, "Sending request");

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                return Performance::Crashed(format!("request to `{}` failed: {err}", spec.url))
            }
        };
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                return Performance::Crashed(format!(
                    "reading response of `{}` failed: {err}",
                    spec.url
                ))
            }
        };
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        environment.record_response(thesis.slug(), body);

        debug!(slug = %thesis.slug(), status, "Received response");
        if let Some(expected) = &http.response {
            if let Err(message) = check_envelope(expected, status, content_type.as_deref()) {
                return Performance::Failed(message);
            }
        }
        Performance::Passed
    }
}
