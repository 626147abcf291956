use crate::error::AppError;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use tracing::info;

const INIT_SCHEMA: &str = include_str!("../migrations/0001_init.sql");

pub async fn init_pool(database_url: &str, max_connections: usize) -> Result<Pool, AppError> {
    let pg_config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| AppError::Config(format!("DATABASE_URL: {e}")))?;

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(mgr)
        .max_size(max_connections)
        .build()
        .map_err(|e| AppError::StartServer(format!("build pool: {e}")))?;

    // fail fast on an unreachable database
    let client = pool.get().await?;
    client.simple_query("SELECT 1").await?;
    info!(max_connections, "Database pool created and verified");

    Ok(pool)
}

/// Create the schema if it does not exist yet. Safe to run on every start.
pub async fn run_migrations(pool: &Pool) -> Result<(), AppError> {
    let client = pool.get().await?;
    client.batch_execute(INIT_SCHEMA).await?;
    info!("Database schema is up to date");
    Ok(())
}
