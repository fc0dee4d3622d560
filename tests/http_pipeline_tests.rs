use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use specflow::policy::SaveSettings;
use specflow::{
    BatchedSavePolicy, Flow, Maintainer, MemoryCancelBus, MemoryFlowRepository, MemoryGuard,
    MemoryPipelineRepository, MemorySpecificationRepository, PipelineService, RunOutcome, Slug,
    Specification, SpecificationBuilder, SpecificationRepository, State, TokioEnqueuer,
};

fn users_specification(base: &str) -> Specification {
    let users = format!("{base}/users");
    let missing = format!("{base}/missing");
    SpecificationBuilder::new()
        .with_id("users-spec")
        .with_owner_id("ann")
        .with_story("users", |story| {
            story
                .with_scenario("create", |scenario| {
                    scenario
                        .with_thesis("post", |thesis| {
                            thesis
                                .with_statement("when", "a user is created")
                                .with_http(|http| {
                                    http.with_request("POST", users)
                                        .with_request_content_type("application/json")
                                        .with_request_body(json!({"name": "ann"}))
                                        .with_response([201], "application/json");
                                })
                                .with_assertion(|assertion| {
                                    assertion.with_method("jsonpath").with_assert("$.id", json!(7));
                                });
                        })
                        .with_thesis("named", |thesis| {
                            thesis
                                .with_statement("then", "the user carries the name")
                                .with_dependency("post")
                                .with_assertion(|assertion| {
                                    assertion
                                        .with_method("jsonpath")
                                        .with_assert("$.name", json!("ann"));
                                });
                        });
                })
                .with_scenario("lookup", |scenario| {
                    scenario.with_thesis("unknown", |thesis| {
                        thesis
                            .with_statement("when", "an unknown user is fetched")
                            .with_http(|http| {
                                http.with_request("GET", missing)
                                    .with_response([200], "application/json");
                            });
                    });
                });
        })
        .build()
        .unwrap()
}

fn thesis_errors(flow: &Flow, scenario: &str, thesis: &str) -> (State, Vec<String>) {
    let status = flow
        .status(&Slug::scenario("users", scenario))
        .and_then(|status| status.thesis_status(thesis))
        .unwrap();
    (status.state(), status.occurred_errors().to_vec())
}

#[tokio::test]
async fn http_and_assertion_performers_drive_a_real_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users"))
        .and(body_json(json!({"name": "ann"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7, "name": "ann"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "no such user"})))
        .mount(&server)
        .await;

    let specifications = Arc::new(MemorySpecificationRepository::new());
    specifications
        .save(&users_specification(&server.uri()))
        .await
        .unwrap();
    let flows = Arc::new(MemoryFlowRepository::new());
    let bus = Arc::new(MemoryCancelBus::new());
    let maintainer = Maintainer::new(
        Arc::new(MemoryGuard::new(Duration::from_secs(60))),
        bus.clone(),
        Arc::new(TokioEnqueuer::new(4)),
        Arc::new(BatchedSavePolicy::new(
            flows.clone(),
            SaveSettings::default(),
            5,
        )),
    );
    let service = PipelineService::new(
        specifications,
        Arc::new(MemoryPipelineRepository::new()),
        flows.clone(),
        bus,
        Arc::new(maintainer),
    );

    let report = service
        .start_pipeline("users-run", "users-spec", "ann")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    let flow = &report.flow;
    assert_eq!(thesis_errors(flow, "create", "post"), (State::Passed, vec![]));
    assert_eq!(thesis_errors(flow, "create", "named"), (State::Passed, vec![]));

    let (state, errors) = thesis_errors(flow, "lookup", "unknown");
    assert_eq!(state, State::Failed);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("404"));

    assert_eq!(flow.state(), State::Failed);
    assert!(flow.is_finished());
    assert_eq!(&service.get_flow("users-run", "ann").await.unwrap(), flow);
}
