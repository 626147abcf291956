#![allow(dead_code)]

use actix_web::{dev::ServerHandle, web, App, HttpServer};
use chrono::{DateTime, Utc};
use conversation_gateway::{
    config::Config,
    middleware::{auth::Claims, JwtValidator},
    routes,
    services::MemoryConversationStore,
    sharding::ShardRouter,
    state::AppState,
    transport::{memory::MemoryTransport, PubSubTransport, SubscriptionHandle},
    websocket::ConnectionRegistry,
};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(3);

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub store: MemoryConversationStore,
    subscriptions: SubscriptionHandle,
    handle: ServerHandle,
}

impl TestServer {
    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, conversation_id: Uuid) -> String {
        format!("ws://{}/ws/{}", self.addr, conversation_id)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.state.registry
    }

    pub fn token(&self, user_id: Uuid) -> String {
        mint_token(&self.state.config, user_id)
    }

    /// Open a socket as `user_id` and consume the history batch.
    pub async fn connect(&self, user_id: Uuid, conversation_id: Uuid) -> (WsClient, serde_json::Value) {
        let mut request = self.ws_url(conversation_id).into_client_request().unwrap();
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.token(user_id)).parse().unwrap(),
        );
        let (mut ws, _) = connect_async(request).await.unwrap();
        let history = next_json(&mut ws).await;
        (ws, history)
    }

    pub async fn stop(self) {
        self.subscriptions.abort();
        self.handle.stop(false).await;
    }
}

pub fn mint_token(config: &Config, user_id: Uuid) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: Utc::now().timestamp() + 600,
        iss: config.auth.jwt_issuer.clone(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.auth.jwt_key.as_bytes()),
    )
    .unwrap()
}

/// Gateway on an ephemeral port backed by the in-memory transport and store.
pub async fn spawn_server() -> TestServer {
    let router = ShardRouter::with_count(1).unwrap();
    spawn_server_with(Arc::new(MemoryTransport::new(router)), MemoryConversationStore::new()).await
}

/// Gateway sharing a transport and store with other test servers, as separate
/// processes share a broker and a database.
pub async fn spawn_server_with(
    transport: Arc<dyn PubSubTransport>,
    store: MemoryConversationStore,
) -> TestServer {
    spawn_server_with_config(transport, store, Config::test_defaults()).await
}

pub async fn spawn_server_with_config(
    transport: Arc<dyn PubSubTransport>,
    store: MemoryConversationStore,
    config: Config,
) -> TestServer {
    let config = Arc::new(config);
    let router = ShardRouter::with_count(transport.group_count()).unwrap();

    let state = AppState {
        registry: ConnectionRegistry::new(),
        transport,
        router,
        auth: Arc::new(JwtValidator::new(&config.auth)),
        members: Arc::new(store.clone()),
        messages: Arc::new(store.clone()),
        config,
    };
    let subscriptions = state.start_subscriptions().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let app_state = web::Data::new(state.clone());
    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .workers(1)
    .listen(listener)
    .unwrap()
    .run();
    let handle = server.handle();
    actix_rt::spawn(server);

    TestServer {
        addr,
        state,
        store,
        subscriptions,
        handle,
    }
}

pub async fn send_json(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(WsMessage::text(value.to_string())).await.unwrap();
}

/// Next frame that is not a ping/pong.
pub async fn next_frame(ws: &mut WsClient) -> Option<WsMessage> {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next()).await.ok()??.ok()?;
        match msg {
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => return Some(other),
        }
    }
}

pub async fn next_json(ws: &mut WsClient) -> serde_json::Value {
    match next_frame(ws).await {
        Some(WsMessage::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

fn deadline() -> tokio::time::Instant {
    tokio::time::Instant::now() + WAIT
}

async fn tick() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Wait until exactly `expected` users are registered locally for the conversation.
pub async fn wait_for_users(
    registry: &ConnectionRegistry,
    conversation_id: Uuid,
    expected: &[Uuid],
) -> bool {
    let mut expected = expected.to_vec();
    expected.sort();
    let until = deadline();
    while tokio::time::Instant::now() < until {
        let mut users = registry.users_in(conversation_id).await;
        users.sort();
        if users == expected {
            return true;
        }
        tick().await;
    }
    false
}

pub async fn wait_for_conversations(registry: &ConnectionRegistry, expected: usize) -> bool {
    let until = deadline();
    while tokio::time::Instant::now() < until {
        if registry.conversation_count().await == expected {
            return true;
        }
        tick().await;
    }
    false
}

pub async fn wait_for_messages(
    store: &MemoryConversationStore,
    conversation_id: Uuid,
    expected: usize,
) -> bool {
    let until = deadline();
    while tokio::time::Instant::now() < until {
        if store.message_count(conversation_id).await == expected {
            return true;
        }
        tick().await;
    }
    false
}

pub async fn wait_for_read_after(
    store: &MemoryConversationStore,
    conversation_id: Uuid,
    user_id: Uuid,
    after: DateTime<Utc>,
) -> bool {
    let until = deadline();
    while tokio::time::Instant::now() < until {
        if let Some(member) = store.member(conversation_id, user_id).await {
            if member.last_read_at > after {
                return true;
            }
        }
        tick().await;
    }
    false
}
