use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use futures::FutureExt;
use specflow::{
    EnqueueError, Enqueuer, ErrorClass, Flow, Guard, GuardError, Lease, MaintainerError,
    MemoryCancelBus, MemoryFlowRepository, MemoryGuard, MemoryPipelineRepository,
    MemorySpecificationRepository, Maintainer, Performance, Performer, PerformerKind, Pipeline,
    PipelineError, PipelineRepository, PipelineService, PolicyKind, RunOutcome, SavePerStepPolicy,
    ServiceError, Slug, Specification, SpecificationBuilder, SpecificationRepository,
    SpecflowConfig, State, TokioEnqueuer,
};
use specflow::performer::Environment;
use specflow::policy::SaveSettings;
use specflow::specification::Thesis;

#[derive(Clone)]
enum Behavior {
    Pass,
    Fail(&'static str),
    Crash(&'static str),
    Sleep(Duration),
    Panic,
    /// Signals the notify once started, then passes after the delay.
    Announce(Arc<Notify>, Duration),
}

/// Performer whose outcome per thesis name is scripted by the test.
#[derive(Default)]
struct ScriptedPerformer {
    script: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedPerformer {
    fn set(&self, thesis: &str, behavior: Behavior) {
        self.script
            .lock()
            .unwrap()
            .insert(thesis.to_string(), behavior);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_of(&self, thesis: &str) -> usize {
        self.calls().iter().filter(|name| *name == thesis).count()
    }
}

#[async_trait]
impl Performer for ScriptedPerformer {
    fn kind(&self) -> PerformerKind {
        PerformerKind::Assertion
    }

    fn accepts(&self, _thesis: &Thesis) -> bool {
        true
    }

    async fn perform(&self, thesis: &Thesis, _environment: &Environment) -> Performance {
        let name = thesis.slug().name().to_string();
        self.calls.lock().unwrap().push(name.clone());
        let behavior = self
            .script
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or(Behavior::Pass);

        match behavior {
            Behavior::Pass => Performance::Passed,
            Behavior::Fail(message) => Performance::Failed(message.to_string()),
            Behavior::Crash(message) => Performance::Crashed(message.to_string()),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Performance::Passed
            }
            Behavior::Panic => panic!("performer blew up"),
            Behavior::Announce(started, duration) => {
                started.notify_one();
                tokio::time::sleep(duration).await;
                Performance::Passed
            }
        }
    }
}

struct Harness {
    service: PipelineService,
    guard: Arc<MemoryGuard>,
    flows: Arc<MemoryFlowRepository>,
    pipelines: Arc<MemoryPipelineRepository>,
    performer: Arc<ScriptedPerformer>,
}

fn checks(thesis: &mut specflow::specification::ThesisBuilder) {
    thesis
        .with_statement("then", "it holds")
        .with_assertion(|assertion| {
            assertion.with_method("jsonpath");
        });
}

/// Story `shop` with scenario `browse` (`list`) and scenario `checkout`
/// (`login`, `pay` after `login`). Scenarios run in slug order.
fn shop_specification() -> Specification {
    SpecificationBuilder::new()
        .with_id("shop-spec")
        .with_owner_id("ann")
        .with_title("Shop")
        .with_story("shop", |story| {
            story
                .with_as_a("customer")
                .with_in_order_to("buy things")
                .with_want_to("check out")
                .with_scenario("checkout", |scenario| {
                    scenario
                        .with_thesis("login", checks)
                        .with_thesis("pay", |thesis| {
                            checks(thesis);
                            thesis.with_dependency("login");
                        });
                })
                .with_scenario("browse", |scenario| {
                    scenario.with_thesis("list", checks);
                });
        })
        .build()
        .unwrap()
}

async fn harness(flow_timeout: Duration) -> Harness {
    let specifications = Arc::new(MemorySpecificationRepository::new());
    specifications.save(&shop_specification()).await.unwrap();

    let guard = Arc::new(MemoryGuard::new(Duration::from_secs(60)));
    let flows = Arc::new(MemoryFlowRepository::new());
    let pipelines = Arc::new(MemoryPipelineRepository::new());
    let bus = Arc::new(MemoryCancelBus::new());
    let performer = Arc::new(ScriptedPerformer::default());

    let maintainer = Maintainer::new(
        guard.clone(),
        bus.clone(),
        Arc::new(TokioEnqueuer::new(2)),
        Arc::new(SavePerStepPolicy::new(flows.clone(), SaveSettings::default())),
    )
    .with_performers(vec![performer.clone() as Arc<dyn Performer>])
    .with_flow_timeout(flow_timeout);

    let service = PipelineService::new(
        specifications,
        pipelines.clone(),
        flows.clone(),
        bus,
        Arc::new(maintainer),
    );

    Harness {
        service,
        guard,
        flows,
        pipelines,
        performer,
    }
}

fn thesis_state(flow: &Flow, scenario: &str, thesis: &str) -> State {
    flow.status(&Slug::scenario("shop", scenario))
        .and_then(|status| status.thesis_status(thesis))
        .map(|status| status.state())
        .unwrap()
}

fn scenario_state(flow: &Flow, scenario: &str) -> State {
    flow.status(&Slug::scenario("shop", scenario))
        .map(|status| status.state())
        .unwrap()
}

async fn lease_is_free(guard: &MemoryGuard, pipeline_id: &str) -> bool {
    match guard.try_acquire(pipeline_id).await {
        Ok(lease) => {
            guard.release(lease).await.unwrap();
            true
        }
        Err(_) => false,
    }
}

#[tokio::test]
async fn started_pipeline_runs_to_passed_and_is_persisted() {
    let h = harness(Duration::from_secs(30)).await;

    let report = h
        .service
        .start_pipeline("p1", "shop-spec", "ann")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.save_failures.is_empty());
    assert_eq!(report.flow.state(), State::Passed);
    assert!(report.flow.is_finished());

    let stored = h.service.get_flow("p1", "ann").await.unwrap();
    assert_eq!(stored, report.flow);
    assert_eq!(h.flows.save_count(), report.steps as u64);

    let pipeline = h.pipelines.get("p1").await.unwrap();
    assert_eq!(pipeline.started_by(), Some("ann"));
    assert_eq!(pipeline.flow_id(), Some(report.flow.id()));
    assert!(lease_is_free(&h.guard, "p1").await);
}

#[tokio::test]
async fn dependency_runs_first_and_its_failure_cancels_dependents() {
    let h = harness(Duration::from_secs(30)).await;
    h.performer.set("login", Behavior::Fail("wrong password"));

    let report = h
        .service
        .start_pipeline("p1", "shop-spec", "ann")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let flow = &report.flow;
    assert_eq!(thesis_state(flow, "checkout", "login"), State::Failed);
    assert_eq!(thesis_state(flow, "checkout", "pay"), State::Canceled);
    assert_eq!(scenario_state(flow, "checkout"), State::Failed);
    assert_eq!(scenario_state(flow, "browse"), State::Passed);
    assert_eq!(flow.state(), State::Failed);
    assert_eq!(h.performer.calls_of("pay"), 0);

    let pay = flow
        .status(&Slug::scenario("shop", "checkout"))
        .and_then(|status| status.thesis_status("pay"))
        .unwrap();
    assert_eq!(
        pay.occurred_errors(),
        ["dependency `shop.checkout.login` did not pass"]
    );
}

#[tokio::test]
async fn passing_dependency_is_performed_before_its_dependent() {
    let h = harness(Duration::from_secs(30)).await;

    h.service
        .start_pipeline("p1", "shop-spec", "ann")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let calls = h.performer.calls();
    let login = calls.iter().position(|name| name == "login").unwrap();
    let pay = calls.iter().position(|name| name == "pay").unwrap();
    assert!(login < pay);
}

#[tokio::test]
async fn crash_in_one_scenario_does_not_stop_the_other() {
    let h = harness(Duration::from_secs(30)).await;
    h.performer.set("list", Behavior::Crash("connection reset"));

    let report = h
        .service
        .start_pipeline("p1", "shop-spec", "ann")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(scenario_state(&report.flow, "browse"), State::Crashed);
    assert_eq!(scenario_state(&report.flow, "checkout"), State::Passed);
    assert_eq!(report.flow.state(), State::Crashed);
}

#[tokio::test]
async fn panicking_performer_crashes_its_thesis_only() {
    let h = harness(Duration::from_secs(30)).await;
    h.performer.set("login", Behavior::Panic);

    let report = h
        .service
        .start_pipeline("p1", "shop-spec", "ann")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let login = report
        .flow
        .status(&Slug::scenario("shop", "checkout"))
        .and_then(|status| status.thesis_status("login"))
        .unwrap()
        .clone();
    assert_eq!(login.state(), State::Crashed);
    assert!(login.occurred_errors()[0].contains("performer blew up"));
    assert_eq!(scenario_state(&report.flow, "browse"), State::Passed);
    assert!(lease_is_free(&h.guard, "p1").await);
}

#[tokio::test]
async fn second_start_is_a_conflict() {
    let h = harness(Duration::from_secs(30)).await;
    h.service
        .start_pipeline("p1", "shop-spec", "ann")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let err = h
        .service
        .start_pipeline("p1", "shop-spec", "bob")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Pipeline(PipelineError::AlreadyStarted(_))
    ));
    assert_eq!(err.class(), ErrorClass::Conflict);
}

#[tokio::test]
async fn start_is_rejected_while_another_holder_has_the_lease() {
    let h = harness(Duration::from_secs(30)).await;
    let _held = h.guard.try_acquire("p1").await.unwrap();

    let err = h
        .service
        .start_pipeline("p1", "shop-spec", "ann")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Maintainer(MaintainerError::Guard(GuardError::AlreadyAcquired { .. }))
    ));
    assert_eq!(err.class(), ErrorClass::Conflict);
    assert!(h.pipelines.get("p1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn canceling_a_pipeline_that_never_started_fails() {
    let h = harness(Duration::from_secs(30)).await;
    h.pipelines
        .save(&Pipeline::new("p1", "ann", "shop-spec"))
        .await
        .unwrap();

    let err = h.service.cancel_pipeline("p1", "ann").await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Pipeline(PipelineError::NotStarted(_))
    ));
}

#[tokio::test]
async fn cancel_before_the_run_starts_cancels_everything() {
    let h = harness(Duration::from_secs(30)).await;

    let handle = h
        .service
        .start_pipeline("p1", "shop-spec", "ann")
        .await
        .unwrap();
    h.service.cancel_pipeline("p1", "bob").await.unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Canceled);
    assert!(report.flow.is_finished());
    assert_eq!(report.flow.state(), State::Canceled);
    assert!(h.performer.calls().is_empty());

    let pipeline = h.pipelines.get("p1").await.unwrap();
    assert_eq!(pipeline.canceled_by(), Some("bob"));
    assert!(lease_is_free(&h.guard, "p1").await);
}

#[tokio::test]
async fn cancel_mid_run_lets_in_flight_theses_finish() {
    let h = harness(Duration::from_secs(30)).await;
    let started = Arc::new(Notify::new());
    h.performer.set(
        "login",
        Behavior::Announce(started.clone(), Duration::from_millis(100)),
    );

    let handle = h
        .service
        .start_pipeline("p1", "shop-spec", "ann")
        .await
        .unwrap();
    started.notified().await;
    h.service.cancel_pipeline("p1", "bob").await.unwrap();
    let report = handle.wait().await.unwrap();

    let flow = &report.flow;
    assert_eq!(report.outcome, RunOutcome::Canceled);
    assert_eq!(thesis_state(flow, "checkout", "login"), State::Passed);
    assert_eq!(thesis_state(flow, "checkout", "pay"), State::Canceled);
    assert_eq!(scenario_state(flow, "checkout"), State::Canceled);
    assert_eq!(scenario_state(flow, "browse"), State::Passed);
    assert_eq!(flow.state(), State::Canceled);
    assert_eq!(h.performer.calls_of("pay"), 0);
}

#[tokio::test(start_paused = true)]
async fn flow_timeout_crashes_unfinished_entries() {
    let h = harness(Duration::from_millis(50)).await;
    h.performer.set("login", Behavior::Sleep(Duration::from_secs(3600)));

    let report = h
        .service
        .start_pipeline("p1", "shop-spec", "ann")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let flow = &report.flow;
    assert_eq!(report.outcome, RunOutcome::TimedOut);
    assert!(flow.is_finished());
    assert_eq!(thesis_state(flow, "checkout", "login"), State::Crashed);
    assert_eq!(thesis_state(flow, "checkout", "pay"), State::Crashed);
    assert_eq!(scenario_state(flow, "checkout"), State::Crashed);
    assert_eq!(scenario_state(flow, "browse"), State::Passed);
    assert_eq!(flow.state(), State::Crashed);

    let login = flow
        .status(&Slug::scenario("shop", "checkout"))
        .and_then(|status| status.thesis_status("login"))
        .unwrap();
    assert_eq!(login.occurred_errors(), ["flow timed out after 50ms"]);

    let stored = h.service.get_flow("p1", "ann").await.unwrap();
    assert_eq!(&stored, flow);
    assert!(lease_is_free(&h.guard, "p1").await);
}

#[tokio::test]
async fn restart_resumes_and_skips_passed_theses() {
    let h = harness(Duration::from_secs(30)).await;
    h.performer.set("pay", Behavior::Fail("card declined"));

    let first = h
        .service
        .start_pipeline("p1", "shop-spec", "ann")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(first.flow.state(), State::Failed);

    h.performer.set("pay", Behavior::Pass);
    let second = h
        .service
        .restart_pipeline("p1", "bob")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(second.flow.id(), first.flow.id());
    assert_eq!(second.flow.state(), State::Passed);
    assert_eq!(h.performer.calls_of("login"), 1);
    assert_eq!(h.performer.calls_of("list"), 1);
    assert_eq!(h.performer.calls_of("pay"), 2);

    let pay = second
        .flow
        .status(&Slug::scenario("shop", "checkout"))
        .and_then(|status| status.thesis_status("pay"))
        .unwrap();
    assert_eq!(pay.occurred_errors(), ["card declined"]);
    assert_eq!(
        h.pipelines.get("p1").await.unwrap().started_by(),
        Some("bob")
    );
}

#[tokio::test]
async fn restart_while_running_is_a_conflict() {
    let h = harness(Duration::from_secs(30)).await;
    let started = Arc::new(Notify::new());
    h.performer.set(
        "login",
        Behavior::Announce(started.clone(), Duration::from_millis(200)),
    );

    let handle = h
        .service
        .start_pipeline("p1", "shop-spec", "ann")
        .await
        .unwrap();
    started.notified().await;

    let err = h.service.restart_pipeline("p1", "bob").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Conflict);

    handle.wait().await.unwrap();
    assert!(lease_is_free(&h.guard, "p1").await);
}

/// Delegates to a [`MemoryGuard`] but every renewal finds the lease taken
/// over by another holder.
struct UsurpedGuard {
    inner: MemoryGuard,
    ttl: Duration,
}

#[async_trait]
impl Guard for UsurpedGuard {
    async fn try_acquire(&self, pipeline_id: &str) -> Result<Lease, GuardError> {
        self.inner.try_acquire(pipeline_id).await
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease, GuardError> {
        Err(GuardError::LeaseLost {
            pipeline_id: lease.pipeline_id().to_string(),
            holder: "someone else".to_string(),
        })
    }

    async fn release(&self, lease: Lease) -> Result<(), GuardError> {
        self.inner.release(lease).await
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

fn started(pipeline_id: &str) -> Pipeline {
    let mut pipeline = Pipeline::new(pipeline_id, "ann", "shop-spec");
    pipeline.start(format!("{pipeline_id}-flow"), "ann").unwrap();
    pipeline
}

fn maintainer_with(
    guard: Arc<dyn Guard>,
    enqueuer: Arc<dyn Enqueuer>,
    performer: Arc<ScriptedPerformer>,
) -> Maintainer {
    Maintainer::new(
        guard,
        Arc::new(MemoryCancelBus::new()),
        enqueuer,
        Arc::new(SavePerStepPolicy::new(
            Arc::new(MemoryFlowRepository::new()),
            SaveSettings::default(),
        )),
    )
    .with_performers(vec![performer as Arc<dyn Performer>])
}

#[tokio::test]
async fn queued_run_keeps_its_lease_past_the_ttl() {
    let guard = Arc::new(MemoryGuard::new(Duration::from_millis(150)));
    let enqueuer = Arc::new(TokioEnqueuer::new(1));
    let blocker = enqueuer
        .enqueue(tokio::time::sleep(Duration::from_millis(500)).boxed())
        .unwrap();
    let maintainer = maintainer_with(
        guard.clone(),
        enqueuer.clone(),
        Arc::new(ScriptedPerformer::default()),
    );

    let handle = maintainer
        .maintain(&started("p1"), Arc::new(shop_specification()), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = maintainer
        .maintain(&started("p1"), Arc::new(shop_specification()), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MaintainerError::Guard(GuardError::AlreadyAcquired { .. })
    ));

    blocker.join().await.unwrap();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(lease_is_free(&guard, "p1").await);
}

#[tokio::test]
async fn run_dropped_from_a_closed_pool_releases_its_lease() {
    let guard = Arc::new(MemoryGuard::new(Duration::from_secs(60)));
    let enqueuer = Arc::new(TokioEnqueuer::new(1));
    let blocker = enqueuer
        .enqueue(tokio::time::sleep(Duration::from_millis(100)).boxed())
        .unwrap();
    let performer = Arc::new(ScriptedPerformer::default());
    let maintainer = maintainer_with(guard.clone(), enqueuer.clone(), performer.clone());

    let handle = maintainer
        .maintain(&started("p1"), Arc::new(shop_specification()), None)
        .await
        .unwrap();
    enqueuer.close();

    assert!(matches!(
        handle.wait().await,
        Err(MaintainerError::Enqueue(EnqueueError::Closed))
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(lease_is_free(&guard, "p1").await);
    assert!(performer.calls().is_empty());
    blocker.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lost_lease_stops_the_run_and_crashes_open_entries() {
    let guard = Arc::new(UsurpedGuard {
        inner: MemoryGuard::new(Duration::from_secs(60)),
        ttl: Duration::from_millis(30),
    });
    let performer = Arc::new(ScriptedPerformer::default());
    performer.set("login", Behavior::Sleep(Duration::from_secs(1)));
    let maintainer = maintainer_with(
        guard.clone(),
        Arc::new(TokioEnqueuer::new(1)),
        performer.clone(),
    )
    .with_flow_timeout(Duration::from_secs(3600));

    let report = maintainer
        .maintain(&started("p1"), Arc::new(shop_specification()), None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let flow = &report.flow;
    assert_eq!(report.outcome, RunOutcome::LeaseLost);
    assert!(flow.is_finished());
    assert_eq!(scenario_state(flow, "browse"), State::Passed);
    assert_eq!(thesis_state(flow, "checkout", "login"), State::Passed);
    assert_eq!(thesis_state(flow, "checkout", "pay"), State::Crashed);
    assert_eq!(scenario_state(flow, "checkout"), State::Crashed);
    assert_eq!(performer.calls_of("pay"), 0);

    let pay = flow
        .status(&Slug::scenario("shop", "checkout"))
        .and_then(|status| status.thesis_status("pay"))
        .unwrap();
    assert_eq!(pay.occurred_errors(), ["lease of the pipeline was lost"]);
    assert!(lease_is_free(&guard.inner, "p1").await);
}

#[tokio::test]
async fn maintainer_built_from_config_runs_a_pipeline() {
    let mut config = SpecflowConfig::default();
    config.engine.workers = 1;
    config.engine.flow_timeout_seconds = 7;
    config.persistence.policy = PolicyKind::Batched;
    config.persistence.batch_size = 100;

    let guard = Arc::new(MemoryGuard::new(config.guard.lease_ttl()));
    let flows = Arc::new(MemoryFlowRepository::new());
    let maintainer = Maintainer::from_config(
        &config,
        guard.clone(),
        Arc::new(MemoryCancelBus::new()),
        flows.clone(),
    )
    .with_performers(vec![Arc::new(ScriptedPerformer::default()) as Arc<dyn Performer>]);
    assert_eq!(maintainer.flow_timeout(), Duration::from_secs(7));

    let report = maintainer
        .maintain(&started("p1"), Arc::new(shop_specification()), None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.flow.state(), State::Passed);
    // One batch covers the whole run, so only the final flush saves.
    assert_eq!(flows.save_count(), 1);
    assert!(lease_is_free(&guard, "p1").await);
}
