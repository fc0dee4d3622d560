//! Run orchestration.
//!
//! [`Maintainer::maintain`] acquires the pipeline lease, starts renewing it,
//! subscribes to the cancel signal and enqueues the run. The run drives the
//! executor under the flow timeout and feeds every step through the
//! [`StepsPolicy`]. The lease is released when the run ends, and also when a
//! queued run is dropped before it ever got a worker.

mod executor;
mod lease;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn, Instrument};

use crate::cancel::{CancelSignal, CancelSubscriber, PubSubError};
use crate::config::SpecflowConfig;
use crate::enqueuer::{EnqueueError, Enqueuer, TaskHandle, TokioEnqueuer};
use crate::flow::{Event, Flow, FlowReducer, State, Status, Step, ThesisStatus};
use crate::guard::{Guard, GuardError};
use crate::performer::{default_performers, Performer};
use crate::pipeline::Pipeline;
use crate::policy::{self, PolicyError, StepsPolicy};
use crate::repository::FlowRepository;
use crate::specification::Specification;
use crate::telemetry::create_run_span;
use executor::{open_steps, panic_message, Execution, Executor};
use lease::{HeldLease, LeaseWatch};

const STEP_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaintainerError {
    #[error("pipeline `{0}` has no run to maintain")]
    NoFlow(String),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    PubSub(#[from] PubSubError),
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
    #[error("run of pipeline `{0}` ended without a report")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Canceled,
    TimedOut,
    /// Renewal found the lease held by someone else; open entries crashed.
    LeaseLost,
    Panicked(String),
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub flow: Flow,
    pub outcome: RunOutcome,
    pub steps: usize,
    pub save_failures: Vec<PolicyError>,
}

/// Handle to an enqueued run.
#[derive(Debug)]
pub struct RunHandle {
    pipeline_id: String,
    flow_id: String,
    task: TaskHandle,
    report: oneshot::Receiver<RunReport>,
}

impl RunHandle {
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the run wherever it is. Its lease is released.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Waits for the run, including time spent queued.
    pub async fn wait(self) -> Result<RunReport, MaintainerError> {
        self.task.join().await?;
        self.report
            .await
            .map_err(|_| MaintainerError::Aborted(self.pipeline_id))
    }
}

pub struct Maintainer {
    guard: Arc<dyn Guard>,
    cancels: Arc<dyn CancelSubscriber>,
    enqueuer: Arc<dyn Enqueuer>,
    policy: Arc<dyn StepsPolicy>,
    performers: Arc<[Arc<dyn Performer>]>,
    flow_timeout: Duration,
}

impl Maintainer {
    pub fn new(
        guard: Arc<dyn Guard>,
        cancels: Arc<dyn CancelSubscriber>,
        enqueuer: Arc<dyn Enqueuer>,
        policy: Arc<dyn StepsPolicy>,
    ) -> Self {
        Self {
            guard,
            cancels,
            enqueuer,
            policy,
            performers: default_performers().into(),
            flow_timeout: Duration::from_secs(300),
        }
    }

    /// Worker pool, save policy and flow timeout taken from `config`.
    pub fn from_config(
        config: &SpecflowConfig,
        guard: Arc<dyn Guard>,
        cancels: Arc<dyn CancelSubscriber>,
        flows: Arc<dyn FlowRepository>,
    ) -> Self {
        Self::new(
            guard,
            cancels,
            Arc::new(TokioEnqueuer::from_config(&config.engine)),
            policy::from_config(&config.persistence, flows),
        )
        .with_flow_timeout(config.engine.flow_timeout())
    }

    pub fn with_performers(mut self, performers: Vec<Arc<dyn Performer>>) -> Self {
        self.performers = performers.into();
        self
    }

    pub fn with_flow_timeout(mut self, flow_timeout: Duration) -> Self {
        self.flow_timeout = flow_timeout;
        self
    }

    pub fn flow_timeout(&self) -> Duration {
        self.flow_timeout
    }

    /// Starts maintaining the current run of `pipeline`.
    ///
    /// With `previous`, the run resumes that flow: passed theses are kept,
    /// everything else runs again.
    pub async fn maintain(
        &self,
        pipeline: &Pipeline,
        specification: Arc<Specification>,
        previous: Option<Flow>,
    ) -> Result<RunHandle, MaintainerError> {
        let pipeline_id = pipeline.id().to_string();
        let flow_id = pipeline
            .flow_id()
            .ok_or_else(|| MaintainerError::NoFlow(pipeline_id.clone()))?
            .to_string();

        let lease = self.guard.try_acquire(&pipeline_id).await?;
        // Renewal starts now so that time spent queued never lets it expire.
        let lease = HeldLease::hold(self.guard.clone(), lease);
        let signal = match self.cancels.subscribe(&pipeline_id).await {
            Ok(signal) => signal,
            Err(err) => {
                lease.release().await;
                return Err(err.into());
            }
        };

        let reducer = match &previous {
            Some(flow) => resumed(flow, &specification),
            None => FlowReducer::from_specification(&flow_id, &pipeline_id, &specification),
        };
        let (report_tx, report_rx) = oneshot::channel();
        let run = Run {
            policy: self.policy.clone(),
            performers: self.performers.clone(),
            specification,
            flow_timeout: self.flow_timeout,
        };
        let span = create_run_span(&pipeline_id, &flow_id);
        let task = run
            .execute(lease, signal, reducer, report_tx)
            .instrument(span)
            .boxed();

        // A rejected task is dropped here, which releases its lease.
        let task = self.enqueuer.enqueue(task)?;
        info!(pipeline_id = %pipeline_id, flow_id = %flow_id, resumed = previous.is_some(), "Run enqueued");
        Ok(RunHandle {
            pipeline_id,
            flow_id,
            task,
            report: report_rx,
        })
    }
}

struct Run {
    policy: Arc<dyn StepsPolicy>,
    performers: Arc<[Arc<dyn Performer>]>,
    specification: Arc<Specification>,
    flow_timeout: Duration,
}

impl Run {
    async fn execute(
        self,
        lease: HeldLease,
        mut signal: CancelSignal,
        reducer: FlowReducer,
        report_tx: oneshot::Sender<RunReport>,
    ) {
        let mut watch = lease.watch();
        let result = AssertUnwindSafe(self.drive(reducer, &mut signal, &mut watch))
            .catch_unwind()
            .await;

        lease.release().await;
        signal.unsubscribe();

        match result {
            Ok(report) => {
                info!(
                    state = %report.flow.state(),
                    outcome = ?report.outcome,
                    steps = report.steps,
                    save_failures = report.save_failures.len(),
                    "Run finished"
                );
                let _ = report_tx.send(report);
            }
            Err(panic) => error!(panic = %panic_message(panic.as_ref()), "Run aborted"),
        }
    }

    async fn drive(
        &self,
        reducer: FlowReducer,
        signal: &mut CancelSignal,
        lease: &mut LeaseWatch,
    ) -> RunReport {
        let (tx, rx) = mpsc::channel(STEP_BUFFER);
        let executor = Executor::new(
            self.specification.clone(),
            self.performers.clone(),
            reducer.clone(),
            tx,
        );
        let execution = async {
            let run = tokio::time::timeout(self.flow_timeout, executor.run(signal, lease));
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(Execution::Completed)) => RunOutcome::Completed,
                Ok(Ok(Execution::Canceled)) => RunOutcome::Canceled,
                Ok(Ok(Execution::LeaseLost)) => RunOutcome::LeaseLost,
                Ok(Err(_)) => RunOutcome::TimedOut,
                Err(panic) => RunOutcome::Panicked(panic_message(panic.as_ref())),
            }
        };
        let (applied, outcome) = tokio::join!(self.policy.apply(reducer, rx), execution);

        let mut report = RunReport {
            flow: applied.flow,
            outcome,
            steps: applied.steps,
            save_failures: applied.failures,
        };

        let abort = match &report.outcome {
            RunOutcome::TimedOut => Some(format!("flow timed out after {:?}", self.flow_timeout)),
            RunOutcome::Panicked(message) => Some(format!("execution panicked: {message}")),
            _ => None,
        };
        if let Some(message) = abort {
            warn!(reason = %message, "Crashing unfinished entries");
            let steps = open_steps(&report.flow, Event::Crash, Some(&message));
            if !steps.is_empty() {
                let swept = self
                    .policy
                    .apply(FlowReducer::from_flow(&report.flow), feed(steps))
                    .await;
                report.flow = swept.flow;
                report.steps += swept.steps;
                report.save_failures.extend(swept.failures);
            }
        }
        report
    }
}

fn feed(steps: Vec<Step>) -> mpsc::Receiver<Step> {
    let (tx, rx) = mpsc::channel(steps.len().max(1));
    for step in steps {
        let _ = tx.try_send(step);
    }
    rx
}

/// Seeds a reducer that continues `flow`: passed theses stay passed, every
/// other thesis and its scenario are reset to `NotPerformed` while keeping
/// the errors recorded so far.
fn resumed(flow: &Flow, specification: &Specification) -> FlowReducer {
    let statuses = specification.scenarios().into_iter().map(|scenario| {
        let previous = flow.status(scenario.slug());
        let theses: Vec<ThesisStatus> = scenario
            .theses()
            .into_iter()
            .map(|thesis| {
                let name = thesis.slug().name();
                match previous.and_then(|status| status.thesis_status(name)) {
                    Some(status) if status.state() == State::Passed => status.clone(),
                    Some(status) => ThesisStatus::with_errors(
                        name,
                        State::NotPerformed,
                        status.occurred_errors().to_vec(),
                    ),
                    None => ThesisStatus::new(name, State::NotPerformed),
                }
            })
            .collect();
        let state = if theses.iter().all(|thesis| thesis.state() == State::Passed) {
            State::Passed
        } else {
            State::NotPerformed
        };
        Status::new(scenario.slug().clone(), state, theses).ok()
    });
    FlowReducer::from_statuses(flow.id(), flow.pipeline_id(), statuses)
}
