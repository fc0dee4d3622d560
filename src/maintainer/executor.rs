use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::lease::LeaseWatch;
use crate::cancel::CancelSignal;
use crate::flow::{Event, Flow, FlowReducer, State, Step};
use crate::performer::{Environment, Performer};
use crate::specification::{Scenario, Slug, SlugKind, Specification, Thesis};

/// How the executor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Execution {
    Completed,
    Canceled,
    LeaseLost,
}

/// Why the executor stopped starting theses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Canceled,
    LeaseLost,
}

pub(crate) const LEASE_LOST: &str = "lease of the pipeline was lost";

/// Drives one run of a specification and emits every step it produces.
///
/// The executor keeps its own reduced copy of the flow to know which
/// entries are still open; the authoritative copy is built by the policy
/// from the same steps.
pub(crate) struct Executor {
    specification: Arc<Specification>,
    performers: Arc<[Arc<dyn Performer>]>,
    environment: Environment,
    mirror: FlowReducer,
    steps: mpsc::Sender<Step>,
    halt: Option<Halt>,
}

enum Wake {
    Halt(Halt),
    Finished(Option<(String, Vec<Step>)>),
}

impl Executor {
    pub(crate) fn new(
        specification: Arc<Specification>,
        performers: Arc<[Arc<dyn Performer>]>,
        mirror: FlowReducer,
        steps: mpsc::Sender<Step>,
    ) -> Self {
        Self {
            specification,
            performers,
            environment: Environment::new(),
            mirror,
            steps,
            halt: None,
        }
    }

    pub(crate) async fn run(mut self, signal: &mut CancelSignal, lease: &mut LeaseWatch) -> Execution {
        let specification = self.specification.clone();
        for scenario in specification.scenarios() {
            if self.halt.is_none() {
                if signal.canceled().now_or_never().is_some() {
                    self.halt_with(Halt::Canceled, scenario.slug(), 0);
                } else if lease.is_lost() {
                    self.halt_with(Halt::LeaseLost, scenario.slug(), 0);
                }
            }
            if self.halt.is_some() {
                break;
            }
            let state = self.scenario_state(scenario.slug());
            if state.is_finished() {
                debug!(slug = %scenario.slug(), state = %state, "Skipping finished scenario");
                continue;
            }
            self.run_scenario(scenario, signal, lease).await;
        }

        match self.halt {
            None => Execution::Completed,
            Some(Halt::Canceled) => {
                self.sweep(Event::Cancel, None).await;
                Execution::Canceled
            }
            Some(Halt::LeaseLost) => {
                self.sweep(Event::Crash, Some(LEASE_LOST)).await;
                Execution::LeaseLost
            }
        }
    }

    fn halt_with(&mut self, halt: Halt, slug: &Slug, in_flight: usize) {
        match halt {
            Halt::Canceled => warn!(slug = %slug, in_flight, "Run canceled"),
            Halt::LeaseLost => error!(slug = %slug, in_flight, "Lease lost, stopping run"),
        }
        self.halt = Some(halt);
    }

    async fn run_scenario(
        &mut self,
        scenario: &Scenario,
        signal: &mut CancelSignal,
        lease: &mut LeaseWatch,
    ) {
        info!(slug = %scenario.slug(), "Performing scenario");
        self.emit(scenario_step(scenario.slug(), Event::Perform, None))
            .await;

        let mut pending: Vec<&Thesis> = scenario
            .theses()
            .into_iter()
            .filter(|thesis| !self.thesis_state(thesis.slug()).is_finished())
            .collect();
        let mut running = FuturesUnordered::new();

        loop {
            if self.halt.is_none() {
                self.start_ready(&mut pending, &mut running).await;
            }
            if running.is_empty() {
                break;
            }

            let wake = tokio::select! {
                biased;
                _ = signal.canceled(), if self.halt.is_none() => Wake::Halt(Halt::Canceled),
                _ = lease.lost(), if self.halt.is_none() => Wake::Halt(Halt::LeaseLost),
                finished = running.next() => Wake::Finished(finished),
            };
            match wake {
                Wake::Halt(halt) => self.halt_with(halt, scenario.slug(), running.len()),
                Wake::Finished(Some((name, steps))) => {
                    debug!(slug = %scenario.slug(), thesis = %name, "Thesis finished");
                    for step in steps {
                        self.emit(step).await;
                    }
                }
                Wake::Finished(None) => break,
            }
        }

        if self.halt.is_some() {
            return;
        }
        let event = scenario_result(
            scenario
                .theses()
                .into_iter()
                .map(|thesis| self.thesis_state(thesis.slug())),
        );
        info!(slug = %scenario.slug(), event = %event, "Scenario finished");
        self.emit(scenario_step(scenario.slug(), event, None)).await;
    }

    /// Starts every pending thesis whose dependencies all passed and cancels
    /// those with a dependency that finished otherwise. Repeats until
    /// nothing changes, since a cancellation can unblock further ones.
    async fn start_ready<'a>(
        &mut self,
        pending: &mut Vec<&'a Thesis>,
        running: &mut FuturesUnordered<futures::future::BoxFuture<'static, (String, Vec<Step>)>>,
    ) {
        loop {
            let mut changed = false;
            let mut index = 0;
            while index < pending.len() {
                let thesis = pending[index];
                match self.readiness(thesis) {
                    Readiness::Waiting => index += 1,
                    Readiness::Ready => {
                        pending.remove(index);
                        changed = true;
                        self.emit(thesis_step(thesis.slug(), Event::Perform, None))
                            .await;
                        running.push(
                            perform(
                                thesis.clone(),
                                self.performers.clone(),
                                self.environment.clone(),
                            )
                            .boxed(),
                        );
                    }
                    Readiness::Blocked(dependency) => {
                        pending.remove(index);
                        changed = true;
                        let error = format!("dependency `{dependency}` did not pass");
                        self.emit(thesis_step(thesis.slug(), Event::Cancel, Some(error)))
                            .await;
                    }
                }
            }
            if !changed {
                return;
            }
        }
    }

    fn readiness(&self, thesis: &Thesis) -> Readiness {
        let Ok(scenario) = thesis.slug().scenario_slug() else {
            return Readiness::Ready;
        };
        let mut waiting = false;
        for name in thesis.after() {
            let Ok(dependency) = scenario.child(name.as_str()) else {
                continue;
            };
            match self.thesis_state(&dependency) {
                State::Passed => {}
                State::NotPerformed | State::Performing => waiting = true,
                _ => return Readiness::Blocked(dependency),
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    /// Closes every open thesis and scenario with `event`.
    async fn sweep(&mut self, event: Event, error: Option<&str>) {
        for step in open_steps(&self.mirror.reduce(), event, error) {
            self.emit(step).await;
        }
    }

    async fn emit(&mut self, step: Step) {
        self.mirror.with_step(&step);
        if self.steps.send(step).await.is_err() {
            debug!("Step receiver dropped");
        }
    }

    fn scenario_state(&self, slug: &Slug) -> State {
        self.mirror
            .status(slug)
            .map_or(State::NoState, |status| status.state())
    }

    fn thesis_state(&self, slug: &Slug) -> State {
        self.mirror
            .thesis_status(slug)
            .map_or(State::NoState, |thesis| thesis.state())
    }
}

enum Readiness {
    Ready,
    Waiting,
    Blocked(Slug),
}

/// Runs the accepting performers in order and stops after the first one
/// that does not pass. A panicking performer counts as a crash.
async fn perform(
    thesis: Thesis,
    performers: Arc<[Arc<dyn Performer>]>,
    environment: Environment,
) -> (String, Vec<Step>) {
    let name = thesis.slug().name().to_string();
    let mut steps = Vec::new();

    for performer in performers.iter().filter(|p| p.accepts(&thesis)) {
        let performance = AssertUnwindSafe(performer.perform(&thesis, &environment))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                crate::performer::Performance::Crashed(format!(
                    "{} panicked: {}",
                    performer.kind(),
                    panic_message(panic.as_ref())
                ))
            });
        let passed = performance.is_passed();
        steps.push(
            thesis_step(
                thesis.slug(),
                performance.event(),
                performance.error().map(str::to_string),
            )
            .with_performer(performer.kind()),
        );
        if !passed {
            return (name, steps);
        }
    }

    if steps.is_empty() {
        steps.push(thesis_step(
            thesis.slug(),
            Event::Crash,
            Some("no performer accepts the thesis".to_string()),
        ));
    }
    (name, steps)
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Crash beats fail, fail beats cancel; a scenario passes only if every
/// thesis passed.
pub(crate) fn scenario_result(states: impl IntoIterator<Item = State>) -> Event {
    let states: Vec<State> = states.into_iter().collect();
    if states.contains(&State::Crashed) {
        Event::Crash
    } else if states.contains(&State::Failed) {
        Event::Fail
    } else if states.iter().all(|state| *state == State::Passed) {
        Event::Pass
    } else {
        Event::Cancel
    }
}

/// One `event` step for every thesis and scenario of `flow` that is not
/// finished yet, theses first.
pub(crate) fn open_steps(flow: &Flow, event: Event, error: Option<&str>) -> Vec<Step> {
    let mut steps = Vec::new();
    for status in flow.statuses() {
        for thesis in status.thesis_statuses() {
            if thesis.state().is_finished() {
                continue;
            }
            if let Ok(slug) = status.slug().child(thesis.thesis_name()) {
                steps.push(thesis_step(&slug, event, error.map(str::to_string)));
            }
        }
        if !status.state().is_finished() {
            steps.push(scenario_step(status.slug(), event, error.map(str::to_string)));
        }
    }
    steps
}

fn thesis_step(slug: &Slug, event: Event, error: Option<String>) -> Step {
    debug_assert_eq!(slug.kind(), SlugKind::Thesis);
    let step = Step::Thesis {
        slug: slug.clone(),
        event,
        performer: None,
        error: None,
    };
    match error {
        Some(error) => step.with_error(error),
        None => step,
    }
}

fn scenario_step(slug: &Slug, event: Event, error: Option<String>) -> Step {
    debug_assert_eq!(slug.kind(), SlugKind::Scenario);
    let step = Step::Scenario {
        slug: slug.clone(),
        event,
        error: None,
    };
    match error {
        Some(error) => step.with_error(error),
        None => step,
    }
}
