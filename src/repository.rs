// Storage collaborators. Implementations live outside the engine; the
// `memory` module carries in-process ones.

use async_trait::async_trait;
use thiserror::Error;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::flow::Flow;
use crate::pipeline::Pipeline;
use crate::specification::Specification;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        RepositoryError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait SpecificationRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Specification, RepositoryError>;
    async fn save(&self, specification: &Specification) -> Result<(), RepositoryError>;
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Pipeline, RepositoryError>;
    async fn save(&self, pipeline: &Pipeline) -> Result<(), RepositoryError>;
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn get(&self, flow_id: &str) -> Result<Flow, RepositoryError>;
    async fn save(&self, flow: &Flow) -> Result<(), RepositoryError>;
}
