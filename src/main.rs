use actix_web::{middleware::Logger, web, App, HttpServer};
use conversation_gateway::{
    config, db, error, logging,
    middleware::JwtValidator,
    routes,
    services::PgConversationStore,
    sharding::ShardRouter,
    state::AppState,
    transport::redis::RedisTransport,
    websocket::ConnectionRegistry,
};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let router = ShardRouter::with_count(cfg.redis.group_count)
        .ok_or_else(|| error::AppError::Config("REDIS_GROUP_COUNT must be at least 1".into()))?;

    // Initialize DB pool
    let db = db::init_pool(&cfg.database_url, cfg.database_max_connections)
        .await
        .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;
    db::run_migrations(&db).await?;
    let store = Arc::new(PgConversationStore::new(db));

    let transport = RedisTransport::connect(&cfg.redis, router)
        .await
        .map_err(|e| error::AppError::StartServer(format!("redis: {e}")))?;

    let state = AppState {
        registry: ConnectionRegistry::new(),
        transport: Arc::new(transport),
        router,
        auth: Arc::new(JwtValidator::new(&cfg.auth)),
        members: store.clone(),
        messages: store,
        config: cfg.clone(),
    };

    let subscriptions = state
        .start_subscriptions()
        .await
        .map_err(|e| error::AppError::StartServer(format!("subscribe: {e}")))?;

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(
        %bind_addr,
        env = %cfg.env,
        groups = router.group_count(),
        "starting conversation-gateway"
    );

    let app_state = web::Data::new(state);
    let result = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind {bind_addr}: {e}")))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(format!("run server: {e}")));

    subscriptions.abort();
    tracing::info!("conversation-gateway stopped");
    result
}
