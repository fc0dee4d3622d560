// Specflow - executable HTTP specifications
// Builds and validates specifications, runs them as pipelines and tracks
// their progress as flows.

pub mod cancel;
pub mod config;
pub mod enqueuer;
pub mod flow;
pub mod guard;
pub mod maintainer;
pub mod memory;
pub mod performer;
pub mod pipeline;
pub mod policy;
pub mod repository;
pub mod service;
pub mod specification;
pub mod telemetry;

// Re-export key types for easy access
pub use cancel::{CancelPublisher, CancelSignal, CancelSubscriber, PubSubError};
pub use config::{PolicyKind, SpecflowConfig};
pub use enqueuer::{EnqueueError, Enqueuer, TaskHandle, TokioEnqueuer};
pub use flow::{Event, Flow, FlowParams, FlowReducer, PerformerKind, State, Status, Step, ThesisStatus};
pub use guard::{FileGuard, Guard, GuardError, Lease, MemoryGuard};
pub use maintainer::{Maintainer, MaintainerError, RunHandle, RunOutcome, RunReport};
pub use memory::{
    MemoryCancelBus, MemoryFlowRepository, MemoryPipelineRepository, MemorySpecificationRepository,
};
pub use performer::{AssertionPerformer, Environment, HttpPerformer, Performance, Performer};
pub use pipeline::{Pipeline, PipelineError, PipelineParams, PipelineState};
pub use policy::{BatchedSavePolicy, PolicyError, PolicyReport, SavePerStepPolicy, StepsPolicy};
pub use repository::{FlowRepository, PipelineRepository, RepositoryError, SpecificationRepository};
pub use service::{
    AccessError, AllowAll, Authorizer, ErrorClass, Permission, PipelineService, ServiceError,
};
pub use specification::{
    BuildError, BuildErrors, Slug, SlugError, SlugKind, Specification, SpecificationBuilder,
    SpecificationError,
};
pub use telemetry::{create_run_span, generate_correlation_id, init_telemetry};
