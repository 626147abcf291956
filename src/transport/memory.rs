//! In-process transport on `tokio::sync::broadcast`.
//!
//! Single-process only, as in the integration tests. Lagging
//! subscribers lose payloads, which matches the at-least-once-at-best live path.

use super::{dispatch, EnvelopeHandler, PubSubTransport, SubscriptionHandle, TransportError};
use crate::sharding::{ShardGroup, ShardRouter};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

const DEFAULT_BUFFER_SIZE: usize = 1024;

pub struct MemoryTransport {
    // index == group number
    channels: Vec<broadcast::Sender<String>>,
}

impl MemoryTransport {
    pub fn new(router: ShardRouter) -> Self {
        Self::with_buffer_size(router, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(router: ShardRouter, buffer_size: usize) -> Self {
        let channels = router
            .groups()
            .map(|_| broadcast::channel(buffer_size).0)
            .collect();
        Self { channels }
    }

    fn channel(&self, group: ShardGroup) -> Result<&broadcast::Sender<String>, TransportError> {
        self.channels
            .get(group.index() as usize)
            .ok_or(TransportError::UnknownGroup {
                group,
                group_count: self.group_count(),
            })
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    fn group_count(&self) -> u32 {
        self.channels.len() as u32
    }

    async fn publish(&self, group: ShardGroup, payload: String) -> Result<(), TransportError> {
        let tx = self.channel(group)?;
        // Err only means nobody is subscribed yet; the broker behaves the same way.
        if tx.send(payload).is_err() {
            debug!(group = %group, "Published to a group without subscribers");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        groups: Vec<ShardGroup>,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<SubscriptionHandle, TransportError> {
        let mut tasks = Vec::with_capacity(groups.len());

        for group in groups {
            // receiver exists before we return, nothing published afterwards is missed
            let mut rx = self.channel(group)?.subscribe();
            let handler = Arc::clone(&handler);

            info!(channel = %group.channel_name(), handler = handler.name(), "Subscribed");

            tasks.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => dispatch(handler.as_ref(), group, &payload).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(group = %group, skipped, "Subscriber lagged, payloads dropped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                warn!(group = %group, handler = handler.name(), "Subscription ended");
            }));
        }

        Ok(SubscriptionHandle::new(tasks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HandlerError;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Collect {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl EnvelopeHandler for Collect {
        fn name(&self) -> &'static str {
            "collect"
        }

        async fn handle(&self, payload: &str) -> Result<(), HandlerError> {
            if payload == "bad" {
                return Err(HandlerError::Store("rejected".into()));
            }
            let _ = self.tx.send(payload.to_string());
            Ok(())
        }
    }

    fn router(n: u32) -> ShardRouter {
        ShardRouter::with_count(n).unwrap()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_of_that_group_only() {
        let r = router(2);
        let transport = MemoryTransport::new(r);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = transport
            .subscribe(vec![r.group(1).unwrap()], Arc::new(Collect { tx }))
            .await
            .unwrap();
        assert_eq!(handle.len(), 1);

        transport.publish(r.group(0).unwrap(), "zero".into()).await.unwrap();
        transport.publish(r.group(1).unwrap(), "one".into()).await.unwrap();

        assert_eq!(next(&mut rx).await.as_deref(), Some("one"));
        assert!(rx.try_recv().is_err());
        handle.abort();
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_loop() {
        let r = router(1);
        let transport = MemoryTransport::new(r);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let g = r.group(0).unwrap();

        let handle = transport
            .subscribe(r.groups().collect(), Arc::new(Collect { tx }))
            .await
            .unwrap();

        transport.publish(g, "bad".into()).await.unwrap();
        transport.publish(g, "good".into()).await.unwrap();

        assert_eq!(next(&mut rx).await.as_deref(), Some("good"));
        assert_eq!(handle.finished(), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_unknown_group_rejected() {
        let transport = MemoryTransport::new(router(2));
        let foreign = router(5).group(4).unwrap();

        let err = transport.publish(foreign, "x".into()).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownGroup { group_count: 2, .. }));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let r = router(1);
        let transport = MemoryTransport::new(r);
        assert!(transport.publish(r.group(0).unwrap(), "x".into()).await.is_ok());
    }
}
