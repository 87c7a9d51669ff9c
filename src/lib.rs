// Credential Gate - library root, shared by the binary and integration tests

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod gate;
pub mod http_client;
pub mod middleware;
pub mod routes;
pub mod store;
