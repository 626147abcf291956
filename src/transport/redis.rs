use super::{dispatch, EnvelopeHandler, PubSubTransport, SubscriptionHandle, TransportError};
use crate::config::RedisConfig;
use crate::sharding::{ShardGroup, ShardRouter};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{error, info};

/// Redis pub/sub transport.
///
/// Publishing shares one auto-reconnecting `ConnectionManager`; each subscribed group
/// holds a dedicated pub/sub connection, since subscribed connections cannot issue
/// regular commands.
#[derive(Clone)]
pub struct RedisTransport {
    client: Client,
    publisher: ConnectionManager,
    router: ShardRouter,
}

impl RedisTransport {
    /// Connect and verify the broker answers `PING`.
    pub async fn connect(config: &RedisConfig, router: ShardRouter) -> Result<Self, TransportError> {
        let client = Client::open(config.connection_info()?)?;
        let mut publisher = ConnectionManager::new(client.clone()).await?;

        let pong: String = ::redis::cmd("PING").query_async(&mut publisher).await?;
        info!(
            addr = %config.addr,
            tls = config.tls,
            groups = router.group_count(),
            reply = %pong,
            "Connected to Redis"
        );

        Ok(Self {
            client,
            publisher,
            router,
        })
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    fn group_count(&self) -> u32 {
        self.router.group_count()
    }

    async fn publish(&self, group: ShardGroup, payload: String) -> Result<(), TransportError> {
        let group = self
            .router
            .group(group.index())
            .ok_or(TransportError::UnknownGroup {
                group,
                group_count: self.router.group_count(),
            })?;

        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(group.channel_name(), payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        groups: Vec<ShardGroup>,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<SubscriptionHandle, TransportError> {
        let mut tasks = Vec::with_capacity(groups.len());

        for group in groups {
            if self.router.group(group.index()).is_none() {
                SubscriptionHandle::new(tasks).abort();
                return Err(TransportError::UnknownGroup {
                    group,
                    group_count: self.router.group_count(),
                });
            }

            let channel = group.channel_name();
            let mut pubsub = match self.client.get_async_pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    SubscriptionHandle::new(tasks).abort();
                    return Err(e.into());
                }
            };
            if let Err(e) = pubsub.subscribe(&channel).await {
                SubscriptionHandle::new(tasks).abort();
                return Err(e.into());
            }

            info!(channel = %channel, handler = handler.name(), "Subscribed");

            let handler = Arc::clone(&handler);
            tasks.push(tokio::spawn(async move {
                let mut stream = pubsub.on_message();

                while let Some(msg) = stream.next().await {
                    let payload = match msg.get_payload::<String>() {
                        Ok(p) => p,
                        Err(e) => {
                            error!(group = %group, error = ?e, "Failed to read message payload");
                            continue;
                        }
                    };
                    dispatch(handler.as_ref(), group, &payload).await;
                }

                // no reconnect: the group stays silent until the process restarts
                error!(
                    group = %group,
                    handler = handler.name(),
                    "Redis subscription ended, broker connection lost"
                );
            }));
        }

        Ok(SubscriptionHandle::new(tasks))
    }
}
