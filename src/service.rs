// Boundary commands for pipelines.
//
// Authorization is delegated to an `Authorizer`; the service only
// propagates its verdict.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::cancel::{CancelPublisher, PubSubError};
use crate::flow::Flow;
use crate::guard::GuardError;
use crate::maintainer::{Maintainer, MaintainerError, RunHandle};
use crate::pipeline::{Pipeline, PipelineError};
use crate::repository::{
    FlowRepository, PipelineRepository, RepositoryError, SpecificationRepository,
};
use crate::specification::Specification;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    StartPipeline,
    RestartPipeline,
    CancelPipeline,
    ReadPipeline,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::StartPipeline => "start pipeline",
            Permission::RestartPipeline => "restart pipeline",
            Permission::CancelPipeline => "cancel pipeline",
            Permission::ReadPipeline => "read pipeline",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{actor}` lacks permission to {permission} on `{resource}`")]
pub struct AccessError {
    pub actor: String,
    pub resource: String,
    pub permission: Permission,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        actor: &str,
        resource: &str,
        permission: Permission,
    ) -> Result<(), AccessError>;
}

/// Grants everything. For embedders that authorize before calling in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _: &str, _: &str, _: Permission) -> Result<(), AccessError> {
        Ok(())
    }
}

/// How the boundary layer should present an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Conflict,
    NotFound,
    Validation,
    Access,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("specification `{0}` not found")]
    SpecificationNotFound(String),
    #[error("pipeline `{0}` not found")]
    NotFound(String),
    #[error("flow `{0}` not found")]
    FlowNotFound(String),
    #[error("pipeline `{pipeline_id}` runs specification `{expected}`, not `{actual}`")]
    SpecificationMismatch {
        pipeline_id: String,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Maintainer(#[from] MaintainerError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    PubSub(#[from] PubSubError),
}

impl ServiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::SpecificationNotFound(_)
            | ServiceError::NotFound(_)
            | ServiceError::FlowNotFound(_) => ErrorClass::NotFound,
            ServiceError::SpecificationMismatch { .. } => ErrorClass::Validation,
            ServiceError::Pipeline(_) => ErrorClass::Conflict,
            ServiceError::Maintainer(MaintainerError::Guard(GuardError::AlreadyAcquired {
                ..
            })) => ErrorClass::Conflict,
            ServiceError::Maintainer(MaintainerError::NoFlow(_)) => ErrorClass::Conflict,
            ServiceError::Maintainer(_) => ErrorClass::Infrastructure,
            ServiceError::Access(_) => ErrorClass::Access,
            ServiceError::Repository(RepositoryError::NotFound { .. }) => ErrorClass::NotFound,
            ServiceError::Repository(_) | ServiceError::PubSub(_) => ErrorClass::Infrastructure,
        }
    }
}

pub struct PipelineService {
    specifications: Arc<dyn SpecificationRepository>,
    pipelines: Arc<dyn PipelineRepository>,
    flows: Arc<dyn FlowRepository>,
    publisher: Arc<dyn CancelPublisher>,
    maintainer: Arc<Maintainer>,
    authorizer: Arc<dyn Authorizer>,
}

impl PipelineService {
    pub fn new(
        specifications: Arc<dyn SpecificationRepository>,
        pipelines: Arc<dyn PipelineRepository>,
        flows: Arc<dyn FlowRepository>,
        publisher: Arc<dyn CancelPublisher>,
        maintainer: Arc<Maintainer>,
    ) -> Self {
        Self {
            specifications,
            pipelines,
            flows,
            publisher,
            maintainer,
            authorizer: Arc::new(AllowAll),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Starts the first run of a pipeline, creating the pipeline if needed.
    pub async fn start_pipeline(
        &self,
        pipeline_id: &str,
        specification_id: &str,
        started_by: &str,
    ) -> Result<RunHandle, ServiceError> {
        self.authorizer
            .authorize(started_by, pipeline_id, Permission::StartPipeline)
            .await?;
        let specification = self.specification(specification_id).await?;

        let mut pipeline = match self.pipelines.get(pipeline_id).await {
            Ok(pipeline) => pipeline,
            Err(err) if err.is_not_found() => {
                Pipeline::new(pipeline_id, started_by, specification_id)
            }
            Err(err) => return Err(err.into()),
        };
        if pipeline.specification_id() != specification_id {
            return Err(ServiceError::SpecificationMismatch {
                pipeline_id: pipeline_id.to_string(),
                expected: pipeline.specification_id().to_string(),
                actual: specification_id.to_string(),
            });
        }

        pipeline.start(Uuid::new_v4().to_string(), started_by)?;
        let handle = self
            .maintainer
            .maintain(&pipeline, Arc::new(specification), None)
            .await?;
        let handle = self.persist_started(&pipeline, handle).await?;

        info!(pipeline_id, specification_id, started_by, flow_id = %handle.flow_id(), "Pipeline started");
        Ok(handle)
    }

    /// Runs a pipeline again, resuming its last flow when one was stored.
    pub async fn restart_pipeline(
        &self,
        pipeline_id: &str,
        started_by: &str,
    ) -> Result<RunHandle, ServiceError> {
        self.authorizer
            .authorize(started_by, pipeline_id, Permission::RestartPipeline)
            .await?;
        let mut pipeline = self.pipeline(pipeline_id).await?;
        let specification = self.specification(pipeline.specification_id()).await?;

        let previous = match pipeline.flow_id() {
            Some(flow_id) => match self.flows.get(flow_id).await {
                Ok(flow) => Some(flow),
                Err(err) if err.is_not_found() => {
                    warn!(pipeline_id, flow_id, "Previous flow missing, restarting from scratch");
                    None
                }
                Err(err) => return Err(err.into()),
            },
            None => None,
        };
        let flow_id = previous
            .as_ref()
            .map(|flow| flow.id().to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        pipeline.restart(flow_id, started_by);
        let handle = self
            .maintainer
            .maintain(&pipeline, Arc::new(specification), previous)
            .await?;
        let handle = self.persist_started(&pipeline, handle).await?;

        info!(pipeline_id, started_by, flow_id = %handle.flow_id(), "Pipeline restarted");
        Ok(handle)
    }

    /// Saves a pipeline whose run is already enqueued. A run whose pipeline
    /// could not be stored is unreachable for cancel, so it is aborted.
    async fn persist_started(
        &self,
        pipeline: &Pipeline,
        handle: RunHandle,
    ) -> Result<RunHandle, ServiceError> {
        match self.pipelines.save(pipeline).await {
            Ok(()) => Ok(handle),
            Err(err) => {
                warn!(pipeline_id = %pipeline.id(), flow_id = %handle.flow_id(), error = %err, "Pipeline not saved, aborting its run");
                handle.abort();
                Err(err.into())
            }
        }
    }

    /// Marks the pipeline canceled and signals whichever process runs it.
    pub async fn cancel_pipeline(
        &self,
        pipeline_id: &str,
        canceled_by: &str,
    ) -> Result<(), ServiceError> {
        self.authorizer
            .authorize(canceled_by, pipeline_id, Permission::CancelPipeline)
            .await?;
        let mut pipeline = self.pipeline(pipeline_id).await?;
        pipeline.cancel(canceled_by)?;
        self.pipelines.save(&pipeline).await?;
        self.publisher.publish(pipeline_id).await?;

        info!(pipeline_id, canceled_by, "Pipeline canceled");
        Ok(())
    }

    pub async fn get_pipeline(&self, pipeline_id: &str, actor: &str) -> Result<Pipeline, ServiceError> {
        self.authorizer
            .authorize(actor, pipeline_id, Permission::ReadPipeline)
            .await?;
        self.pipeline(pipeline_id).await
    }

    /// Latest stored snapshot of the pipeline's current run.
    pub async fn get_flow(&self, pipeline_id: &str, actor: &str) -> Result<Flow, ServiceError> {
        let pipeline = self.get_pipeline(pipeline_id, actor).await?;
        let flow_id = pipeline
            .flow_id()
            .ok_or_else(|| PipelineError::NotStarted(pipeline_id.to_string()))?;
        match self.flows.get(flow_id).await {
            Ok(flow) => Ok(flow),
            Err(err) if err.is_not_found() => Err(ServiceError::FlowNotFound(flow_id.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn pipeline(&self, pipeline_id: &str) -> Result<Pipeline, ServiceError> {
        match self.pipelines.get(pipeline_id).await {
            Ok(pipeline) => Ok(pipeline),
            Err(err) if err.is_not_found() => Err(ServiceError::NotFound(pipeline_id.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn specification(&self, specification_id: &str) -> Result<Specification, ServiceError> {
        match self.specifications.get(specification_id).await {
            Ok(specification) => Ok(specification),
            Err(err) if err.is_not_found() => {
                Err(ServiceError::SpecificationNotFound(specification_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}
