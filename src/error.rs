use crate::middleware::error_handling;
use crate::transport::TransportError;
use crate::websocket::RegistryError;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;
use uuid::Uuid;

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        error_handling::into_response(self)
    }
}

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("connection already registered for user {user_id} in conversation {conversation_id}")]
    DuplicateConnection { user_id: Uuid, conversation_id: Uuid },

    #[error("database error: {0}")]
    Database(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal server error")]
    Internal,
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<TransportError> for AppError {
    fn from(e: TransportError) -> Self {
        AppError::Transport(e.to_string())
    }
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateConnection {
                user_id,
                conversation_id,
            } => AppError::DuplicateConnection {
                user_id,
                conversation_id,
            },
        }
    }
}

impl AppError {
    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Forbidden => 403,
            AppError::DuplicateConnection { .. } => 409,
            AppError::Transport(_) => 503,
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Database(_)
            | AppError::Internal => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::Unauthorized.status_code(), 401);
        assert_eq!(AppError::Forbidden.status_code(), 403);
        assert_eq!(
            AppError::DuplicateConnection {
                user_id: Uuid::new_v4(),
                conversation_id: Uuid::new_v4(),
            }
            .status_code(),
            409
        );
        assert_eq!(AppError::Database("boom".into()).status_code(), 500);
        assert_eq!(AppError::Transport("down".into()).status_code(), 503);
    }

    #[test]
    fn test_registry_error_conversion() {
        let user_id = Uuid::new_v4();
        let conversation_id = Uuid::new_v4();
        let err: AppError = RegistryError::DuplicateConnection {
            user_id,
            conversation_id,
        }
        .into();

        assert!(matches!(
            err,
            AppError::DuplicateConnection { user_id: u, conversation_id: c }
                if u == user_id && c == conversation_id
        ));
    }
}
