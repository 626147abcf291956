use crate::error::AppError;
use dotenvy::dotenv;
use redis::{ConnectionInfo, IntoConnectionInfo, RedisResult};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Broker connection settings for the pub/sub transport.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub addr: String,
    pub password: Option<String>,
    /// Number of shard groups (N). Every process in a pool must agree on it.
    pub group_count: u32,
    /// `rediss://` instead of `redis://`; enabled for every environment except `local`.
    pub tls: bool,
}

impl RedisConfig {
    /// Connection settings for `redis::Client::open`. The password is set on the
    /// parsed info rather than embedded in the URL, so it needs no escaping.
    pub fn connection_info(&self) -> RedisResult<ConnectionInfo> {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let mut info = format!("{scheme}://{}/", self.addr).into_connection_info()?;
        info.redis.password = self.password.clone();
        Ok(info)
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HS256 signing secret shared with the auth service
    pub jwt_key: String,
    pub jwt_issuer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    /// Deliveries queued per connection before the client is dropped as too slow.
    pub send_buffer: usize,
    /// Upper bound on one publish; the session is blocked while it runs.
    pub publish_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            client_timeout: Duration::from_secs(30),
            send_buffer: 256,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub env: String,
    pub database_url: String,
    pub database_max_connections: usize,
    pub port: u16,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub websocket: WebSocketConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup (the process
    /// environment in production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AppError::Config("DATABASE_URL missing".into()))?;
        let database_max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10usize)?;
        let port = parse_or(&lookup, "WS_PORT", 8081u16)?;

        let env_name = lookup("ENV").unwrap_or_else(|| "local".to_string());

        let group_count = parse_or(&lookup, "REDIS_GROUP_COUNT", 1u32)?;
        if group_count == 0 {
            return Err(AppError::Config(
                "REDIS_GROUP_COUNT must be at least 1".into(),
            ));
        }

        let redis = RedisConfig {
            addr: lookup("REDIS_ADDR").unwrap_or_else(|| "localhost:6379".to_string()),
            password: lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()),
            group_count,
            tls: env_name != "local",
        };

        let auth = AuthConfig {
            jwt_key: lookup("AUTH_JWT_KEY")
                .filter(|v| !v.is_empty())
                .ok_or_else(|| AppError::Config("AUTH_JWT_KEY missing".into()))?,
            jwt_issuer: lookup("AUTH_JWT_ISSUER").filter(|v| !v.is_empty()),
        };

        let heartbeat_secs = parse_or(&lookup, "WS_HEARTBEAT_INTERVAL_SECS", 5u64)?;
        let timeout_secs = parse_or(&lookup, "WS_CLIENT_TIMEOUT_SECS", 30u64)?;
        if heartbeat_secs == 0 || timeout_secs <= heartbeat_secs {
            return Err(AppError::Config(
                "WS_CLIENT_TIMEOUT_SECS must exceed a non-zero WS_HEARTBEAT_INTERVAL_SECS".into(),
            ));
        }

        let send_buffer = parse_or(&lookup, "WS_SEND_BUFFER", 256usize)?;
        let publish_timeout_ms = parse_or(&lookup, "WS_PUBLISH_TIMEOUT_MS", 5000u64)?;
        if send_buffer == 0 || publish_timeout_ms == 0 {
            return Err(AppError::Config(
                "WS_SEND_BUFFER and WS_PUBLISH_TIMEOUT_MS must be at least 1".into(),
            ));
        }

        Ok(Self {
            env: env_name,
            database_url,
            database_max_connections,
            port,
            redis,
            auth,
            websocket: WebSocketConfig {
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                client_timeout: Duration::from_secs(timeout_secs),
                send_buffer,
                publish_timeout: Duration::from_millis(publish_timeout_ms),
            },
        })
    }

    pub fn test_defaults() -> Self {
        Self {
            env: "local".into(),
            database_url: "postgres://localhost/test".into(),
            database_max_connections: 2,
            port: 8081,
            redis: RedisConfig {
                addr: "127.0.0.1:6379".into(),
                password: None,
                group_count: 1,
                tls: false,
            },
            auth: AuthConfig {
                jwt_key: "test-secret".into(),
                jwt_issuer: None,
            },
            websocket: WebSocketConfig::default(),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw}"))),
        _ => Ok(default),
    }
}
