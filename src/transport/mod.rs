//! Pub/sub transport between gateway processes.
//!
//! Every process publishes envelopes on the channel of a conversation's shard group
//! and subscribes to all groups. Two backends: [`redis::RedisTransport`] for
//! multi-process deployments and [`memory::MemoryTransport`] for a single process.

pub mod memory;
pub mod redis;

use crate::sharding::ShardGroup;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("group {group} is not one of the {group_count} configured groups")]
    UnknownGroup { group: ShardGroup, group_count: u32 },

    #[error("transport closed")]
    Closed,

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of a subscriber for a single envelope. Never ends the subscription.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("store failure: {0}")]
    Store(String),
}

/// Callback invoked for every payload received on a subscribed group.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    /// Short label used in logs ("websocket", "db").
    fn name(&self) -> &'static str;

    async fn handle(&self, payload: &str) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    fn group_count(&self) -> u32;

    /// Publish an opaque payload on a group's channel. Errors are returned to the caller.
    async fn publish(&self, group: ShardGroup, payload: String) -> Result<(), TransportError>;

    /// Subscribe `handler` to every given group, one listening task per group.
    ///
    /// Returns once all subscriptions are established. A handler error is logged and
    /// the loop moves on to the next payload; losing the broker ends that group's task.
    async fn subscribe(
        &self,
        groups: Vec<ShardGroup>,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<SubscriptionHandle, TransportError>;
}

/// Listening tasks of one subscription.
#[derive(Debug, Default)]
pub struct SubscriptionHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of groups whose listening task has ended.
    pub fn finished(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_finished()).count()
    }

    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    pub fn merge(mut self, other: SubscriptionHandle) -> Self {
        self.tasks.extend(other.tasks);
        self
    }
}

/// Run `handler` on one payload and log, rather than propagate, a failure.
pub(crate) async fn dispatch(handler: &dyn EnvelopeHandler, group: ShardGroup, payload: &str) {
    if let Err(e) = handler.handle(payload).await {
        tracing::error!(
            handler = handler.name(),
            group = %group,
            error = %e,
            "Envelope handler failed, skipping payload"
        );
    }
}
