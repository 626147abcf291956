use crate::error::AppError;
use crate::middleware::extract_token;
use crate::state::AppState;
use crate::websocket::message_types::OutboundBatch;
use crate::websocket::session::{ConnectionState, WsSession};
use crate::websocket::ClientHandle;
use actix_web::{get, web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Upgrade to a conversation socket.
///
/// Everything that can reject the client happens before the upgrade: token,
/// membership, history load and registration. The connection is registered before
/// the handshake so no live message published after the history query is lost; it
/// waits in the delivery channel behind the history batch.
#[get("/ws/{conversation_id}")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    query: web::Query<WsQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = Uuid::parse_str(&path.into_inner())
        .map_err(|_| AppError::BadRequest("conversation id must be a UUID".into()))?;
    debug!(conversation_id = %conversation_id, state = ?ConnectionState::Connecting, "WebSocket upgrade requested");

    // Authentication
    let token = extract_token(&req, query.token.as_deref()).ok_or_else(|| {
        warn!(conversation_id = %conversation_id, "WebSocket connection rejected: no token");
        AppError::Unauthorized
    })?;
    let user_id = state.auth.validate(&token).await.inspect_err(|_| {
        warn!(conversation_id = %conversation_id, "WebSocket connection rejected: invalid token");
    })?;

    // Authorization
    if !state.members.is_member(conversation_id, user_id).await? {
        warn!(
            user_id = %user_id,
            conversation_id = %conversation_id,
            "WebSocket connection rejected: not a member"
        );
        return Err(AppError::Forbidden);
    }
    debug!(user_id = %user_id, conversation_id = %conversation_id, state = ?ConnectionState::Authorized, "Membership verified");

    let history = state.messages.history(conversation_id).await?;
    let history = serde_json::to_string(&OutboundBatch::history(&history)).map_err(|e| {
        tracing::error!(error = %e, "Failed to serialize history");
        AppError::Internal
    })?;

    let group = state.router.group_of(conversation_id);
    let (handle, deliveries) = ClientHandle::with_capacity(
        user_id,
        conversation_id,
        group,
        state.config.websocket.send_buffer,
    );
    let connection_id = handle.connection_id;
    state.registry.add(handle).await.inspect_err(|_| {
        warn!(
            user_id = %user_id,
            conversation_id = %conversation_id,
            "WebSocket connection rejected: already connected"
        );
    })?;

    let session = WsSession::new(
        connection_id,
        user_id,
        conversation_id,
        group,
        state.registry.clone(),
        state.transport.clone(),
        state.config.websocket.clone(),
        history,
        deliveries,
    );

    match ws::start(session, &req, stream) {
        Ok(resp) => {
            info!(user_id = %user_id, conversation_id = %conversation_id, group = %group, "WebSocket upgraded");
            Ok(resp)
        }
        Err(e) => {
            state
                .registry
                .remove_connection(user_id, conversation_id, connection_id)
                .await;
            Err(AppError::BadRequest(format!("websocket handshake: {e}")))
        }
    }
}
