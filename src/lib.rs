pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod sharding;
pub mod state;
pub mod transport;
pub mod websocket;
