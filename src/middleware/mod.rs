pub mod auth;
pub mod error_handling;

pub use auth::{extract_token, JwtValidator, TokenValidator};
