pub mod app;
pub mod auth_middleware;
pub mod bootstrap;
pub mod config;
pub mod envelope;
pub mod idempotency;
pub mod problem;
pub mod routes;
pub mod state;
pub mod telemetry;
