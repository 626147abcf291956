use super::message_types::{ClientFrame, Envelope, MessageType, OutboundError};
use super::ConnectionRegistry;
use crate::config::WebSocketConfig;
use crate::sharding::ShardGroup;
use crate::transport::{PubSubTransport, TransportError};
use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, StreamHandler, WrapFuture};
use actix_web_actors::ws;
use error_types::error_codes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::Receiver;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// Lifecycle of a client connection.
///
/// `Connecting` and `Authorized` are passed in the HTTP handler before the upgrade;
/// the session actor only ever sees the last three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authorized,
    Active,
    Closing,
    Closed,
}

/// Live deliveries queued for the socket, drained as a stream by the actor.
pub struct Delivery(String);

/// One actor per WebSocket connection.
///
/// Owns the socket. Inbound frames are turned into publishes on the connection's
/// shard group; deliveries arrive over the registry channel. The registry entry is
/// removed in `stopped`, which runs on every exit path.
pub struct WsSession {
    connection_id: Uuid,
    user_id: Uuid,
    conversation_id: Uuid,
    group: ShardGroup,
    registry: ConnectionRegistry,
    transport: Arc<dyn PubSubTransport>,
    settings: WebSocketConfig,
    hb: Instant,
    state: ConnectionState,
    // first frame written to the socket
    history: Option<String>,
    deliveries: Option<Receiver<String>>,
}

impl WsSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_id: Uuid,
        user_id: Uuid,
        conversation_id: Uuid,
        group: ShardGroup,
        registry: ConnectionRegistry,
        transport: Arc<dyn PubSubTransport>,
        settings: WebSocketConfig,
        history: String,
        deliveries: Receiver<String>,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            conversation_id,
            group,
            registry,
            transport,
            settings,
            hb: Instant::now(),
            state: ConnectionState::Authorized,
            history: Some(history),
            deliveries: Some(deliveries),
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        tracing::debug!(
            user_id = %self.user_id,
            conversation_id = %self.conversation_id,
            from = ?self.state,
            to = ?next,
            "Connection state change"
        );
        self.state = next;
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = self.settings.client_timeout;
        ctx.run_interval(self.settings.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > timeout {
                tracing::warn!(
                    user_id = %act.user_id,
                    conversation_id = %act.conversation_id,
                    "WebSocket heartbeat failed, disconnecting"
                );
                act.transition(ConnectionState::Closing);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn close(&mut self, ctx: &mut ws::WebsocketContext<Self>, code: ws::CloseCode, reason: &str) {
        self.transition(ConnectionState::Closing);
        ctx.close(Some(ws::CloseReason {
            code,
            description: Some(reason.to_string()),
        }));
        ctx.stop();
    }

    fn handle_frame(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    conversation_id = %self.conversation_id,
                    error = %e,
                    "Malformed frame, closing connection"
                );
                self.close(ctx, ws::CloseCode::Protocol, "malformed frame");
                return;
            }
        };

        if frame.message_type == MessageType::Leave {
            tracing::info!(
                user_id = %self.user_id,
                conversation_id = %self.conversation_id,
                "Client left conversation"
            );
            self.close(ctx, ws::CloseCode::Normal, "leave");
            return;
        }

        let envelope = Envelope::from_frame(frame, self.user_id, self.conversation_id);
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize envelope");
                return;
            }
        };

        let transport = Arc::clone(&self.transport);
        let group = self.group;
        let limit = self.settings.publish_timeout;
        // wait: publishes from one connection leave in the order they arrived
        ctx.wait(
            async move {
                tokio::time::timeout(limit, transport.publish(group, payload))
                    .await
                    .unwrap_or(Err(TransportError::Timeout(limit)))
            }
            .into_actor(self)
            .map(|result, act, ctx| {
                if let Err(e) = result {
                    tracing::error!(
                        user_id = %act.user_id,
                        conversation_id = %act.conversation_id,
                        group = %act.group,
                        error = %e,
                        "Publish failed"
                    );
                    let frame = OutboundError::new(error_codes::PUBLISH_FAILED, e.to_string());
                    if let Ok(text) = serde_json::to_string(&frame) {
                        ctx.text(text);
                    }
                }
            }),
        );
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(history) = self.history.take() {
            ctx.text(history);
        }
        if let Some(rx) = self.deliveries.take() {
            ctx.add_stream(ReceiverStream::new(rx).map(Delivery));
        }
        self.hb(ctx);
        self.transition(ConnectionState::Active);

        tracing::info!(
            user_id = %self.user_id,
            conversation_id = %self.conversation_id,
            group = %self.group,
            "WebSocket session started"
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.transition(ConnectionState::Closed);
        tracing::info!(
            user_id = %self.user_id,
            conversation_id = %self.conversation_id,
            "WebSocket session stopped"
        );

        let registry = self.registry.clone();
        let (user_id, conversation_id, connection_id) =
            (self.user_id, self.conversation_id, self.connection_id);
        actix::spawn(async move {
            registry
                .remove_connection(user_id, conversation_id, connection_id)
                .await;
        });
    }
}

impl StreamHandler<Delivery> for WsSession {
    fn handle(&mut self, item: Delivery, ctx: &mut Self::Context) {
        ctx.text(item.0);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // registry dropped our sender: evicted for falling behind
        tracing::warn!(
            user_id = %self.user_id,
            conversation_id = %self.conversation_id,
            "Delivery channel closed, disconnecting"
        );
        self.close(ctx, ws::CloseCode::Again, "delivery backlog");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket protocol error");
                self.close(ctx, ws::CloseCode::Protocol, "protocol error");
                return;
            }
        };
        self.hb = Instant::now();

        match msg {
            ws::Message::Ping(bytes) => ctx.pong(&bytes),
            ws::Message::Pong(_) | ws::Message::Nop => {}
            ws::Message::Text(text) => self.handle_frame(&text, ctx),
            ws::Message::Binary(_) | ws::Message::Continuation(_) => {
                tracing::warn!("Binary WebSocket messages not supported");
                self.close(ctx, ws::CloseCode::Unsupported, "binary frames not supported");
            }
            ws::Message::Close(reason) => {
                tracing::debug!(?reason, "WebSocket close message received");
                self.transition(ConnectionState::Closing);
                ctx.close(reason);
                ctx.stop();
            }
        }
    }
}
