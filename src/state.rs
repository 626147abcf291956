use crate::{
    config::Config,
    middleware::TokenValidator,
    services::{MembershipStore, MessageStore, PersistenceConsumer},
    sharding::ShardRouter,
    transport::{PubSubTransport, SubscriptionHandle, TransportError},
    websocket::{delivery::DeliveryHandler, ConnectionRegistry},
};
use std::sync::Arc;

/// Everything a request handler needs, built once at startup and shared.
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub transport: Arc<dyn PubSubTransport>,
    pub router: ShardRouter,
    pub auth: Arc<dyn TokenValidator>,
    pub members: Arc<dyn MembershipStore>,
    pub messages: Arc<dyn MessageStore>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Subscribe the delivery and persistence pipelines to every shard group.
    ///
    /// The two pipelines share nothing: a failure to persist does not hold back live
    /// delivery and the other way round.
    pub async fn start_subscriptions(&self) -> Result<SubscriptionHandle, TransportError> {
        let groups: Vec<_> = self.router.groups().collect();

        let delivery = self
            .transport
            .subscribe(
                groups.clone(),
                Arc::new(DeliveryHandler::new(self.registry.clone())),
            )
            .await?;

        let persistence = match self
            .transport
            .subscribe(
                groups,
                Arc::new(PersistenceConsumer::new(
                    Arc::clone(&self.members),
                    Arc::clone(&self.messages),
                )),
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                delivery.abort();
                return Err(e);
            }
        };

        tracing::info!(
            groups = self.router.group_count(),
            tasks = delivery.len() + persistence.len(),
            "Subscribed delivery and persistence pipelines"
        );
        Ok(delivery.merge(persistence))
    }
}
