// Pipeline cancellation signals.
//
// A cancel request may reach a different process than the one running the
// pipeline, so it travels through a publish/subscribe bus keyed by pipeline id.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PubSubError {
    #[error("failed to publish cancel signal for pipeline `{pipeline_id}`: {reason}")]
    Publish { pipeline_id: String, reason: String },
    #[error("failed to subscribe to cancel signals of pipeline `{pipeline_id}`: {reason}")]
    Subscribe { pipeline_id: String, reason: String },
}

type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

/// Subscription to the cancel signal of one pipeline.
///
/// Dropping the signal unsubscribes as well.
pub struct CancelSignal {
    receiver: mpsc::Receiver<()>,
    on_unsubscribe: Option<Unsubscribe>,
}

impl CancelSignal {
    pub fn new(receiver: mpsc::Receiver<()>) -> Self {
        Self {
            receiver,
            on_unsubscribe: None,
        }
    }

    pub fn with_unsubscribe(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_unsubscribe = Some(Box::new(hook));
        self
    }

    /// Resolves once cancellation is published. Pends forever if the bus
    /// goes away without publishing.
    pub async fn canceled(&mut self) {
        if self.receiver.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    pub fn unsubscribe(mut self) {
        self.run_unsubscribe();
    }

    fn run_unsubscribe(&mut self) {
        if let Some(hook) = self.on_unsubscribe.take() {
            hook();
        }
    }
}

impl Drop for CancelSignal {
    fn drop(&mut self) {
        self.run_unsubscribe();
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("subscribed", &self.on_unsubscribe.is_some())
            .finish()
    }
}

#[async_trait]
pub trait CancelPublisher: Send + Sync {
    async fn publish(&self, pipeline_id: &str) -> Result<(), PubSubError>;
}

#[async_trait]
pub trait CancelSubscriber: Send + Sync {
    async fn subscribe(&self, pipeline_id: &str) -> Result<CancelSignal, PubSubError>;
}
