// In-process adapters for the storage and cancel-bus collaborators.
//
// Everything lives in maps behind a mutex, so all of these share state
// across clones of the owning `Arc` only.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cancel::{CancelPublisher, CancelSignal, CancelSubscriber, PubSubError};
use crate::flow::Flow;
use crate::pipeline::Pipeline;
use crate::repository::{
    FlowRepository, PipelineRepository, RepositoryError, SpecificationRepository,
};
use crate::specification::Specification;

fn poisoned() -> RepositoryError {
    RepositoryError::Unavailable("in-memory store poisoned".to_string())
}

#[derive(Debug, Default)]
pub struct MemorySpecificationRepository {
    specifications: Mutex<HashMap<String, Specification>>,
}

impl MemorySpecificationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SpecificationRepository for MemorySpecificationRepository {
    async fn get(&self, id: &str) -> Result<Specification, RepositoryError> {
        self.specifications
            .lock()
            .map_err(|_| poisoned())?
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("specification", id))
    }

    async fn save(&self, specification: &Specification) -> Result<(), RepositoryError> {
        self.specifications
            .lock()
            .map_err(|_| poisoned())?
            .insert(specification.id().to_string(), specification.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryPipelineRepository {
    pipelines: Mutex<HashMap<String, Pipeline>>,
}

impl MemoryPipelineRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineRepository for MemoryPipelineRepository {
    async fn get(&self, id: &str) -> Result<Pipeline, RepositoryError> {
        self.pipelines
            .lock()
            .map_err(|_| poisoned())?
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("pipeline", id))
    }

    async fn save(&self, pipeline: &Pipeline) -> Result<(), RepositoryError> {
        self.pipelines
            .lock()
            .map_err(|_| poisoned())?
            .insert(pipeline.id().to_string(), pipeline.clone());
        Ok(())
    }
}

/// Keeps the latest snapshot per flow id plus a count of saves.
#[derive(Debug, Default)]
pub struct MemoryFlowRepository {
    flows: Mutex<HashMap<String, Flow>>,
    saves: AtomicU64,
}

impl MemoryFlowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlowRepository for MemoryFlowRepository {
    async fn get(&self, flow_id: &str) -> Result<Flow, RepositoryError> {
        self.flows
            .lock()
            .map_err(|_| poisoned())?
            .get(flow_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("flow", flow_id))
    }

    async fn save(&self, flow: &Flow) -> Result<(), RepositoryError> {
        self.flows
            .lock()
            .map_err(|_| poisoned())?
            .insert(flow.id().to_string(), flow.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type Subscribers = HashMap<String, Vec<(u64, mpsc::Sender<()>)>>;

/// Cancel bus for a single process: publishing signals every current
/// subscriber of the pipeline.
#[derive(Debug, Clone, Default)]
pub struct MemoryCancelBus {
    subscribers: Arc<Mutex<Subscribers>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryCancelBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, pipeline_id: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.get(pipeline_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl CancelPublisher for MemoryCancelBus {
    async fn publish(&self, pipeline_id: &str) -> Result<(), PubSubError> {
        let subscribers = self.subscribers.lock().map_err(|_| PubSubError::Publish {
            pipeline_id: pipeline_id.to_string(),
            reason: "subscriber table poisoned".to_string(),
        })?;
        let targets = subscribers.get(pipeline_id).map_or(0, Vec::len);
        for (_, sender) in subscribers.get(pipeline_id).into_iter().flatten() {
            // A full buffer already holds a pending cancel.
            let _ = sender.try_send(());
        }
        debug!(pipeline_id, subscribers = targets, "Published cancel signal");
        Ok(())
    }
}

#[async_trait]
impl CancelSubscriber for MemoryCancelBus {
    async fn subscribe(&self, pipeline_id: &str) -> Result<CancelSignal, PubSubError> {
        let (sender, receiver) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .map_err(|_| PubSubError::Subscribe {
                pipeline_id: pipeline_id.to_string(),
                reason: "subscriber table poisoned".to_string(),
            })?
            .entry(pipeline_id.to_string())
            .or_default()
            .push((id, sender));

        let subscribers = self.subscribers.clone();
        let key = pipeline_id.to_string();
        Ok(CancelSignal::new(receiver).with_unsubscribe(move || {
            if let Ok(mut subscribers) = subscribers.lock() {
                if let Some(entries) = subscribers.get_mut(&key) {
                    entries.retain(|(entry, _)| *entry != id);
                    if entries.is_empty() {
                        subscribers.remove(&key);
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn missing_entities_are_not_found() {
        let pipelines = MemoryPipelineRepository::new();
        let err = pipelines.get("nope").await.unwrap_err();
        assert!(err.is_not_found());

        let flows = MemoryFlowRepository::new();
        assert!(flows.get("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn pipeline_round_trips() {
        let pipelines = MemoryPipelineRepository::new();
        let pipeline = Pipeline::new("p", "owner", "spec");
        pipelines.save(&pipeline).await.unwrap();
        assert_eq!(pipelines.get("p").await.unwrap(), pipeline);
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_of_the_pipeline() {
        let bus = MemoryCancelBus::new();
        let mut first = bus.subscribe("p").await.unwrap();
        let mut second = bus.subscribe("p").await.unwrap();
        let mut other = bus.subscribe("q").await.unwrap();

        bus.publish("p").await.unwrap();

        first.canceled().await;
        second.canceled().await;
        assert!(
            tokio::time::timeout(Duration::from_millis(20), other.canceled())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_subscription() {
        let bus = MemoryCancelBus::new();
        let signal = bus.subscribe("p").await.unwrap();
        let dropped = bus.subscribe("p").await.unwrap();
        assert_eq!(bus.subscriber_count("p"), 2);

        signal.unsubscribe();
        assert_eq!(bus.subscriber_count("p"), 1);
        drop(dropped);
        assert_eq!(bus.subscriber_count("p"), 0);

        bus.publish("p").await.unwrap();
    }
}
