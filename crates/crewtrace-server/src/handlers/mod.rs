//! HTTP route handlers for the crewtrace server.

pub mod events;
pub mod live;
pub mod runs;
pub mod steps;

/// Health check endpoint.
pub async fn health() -> &'static str {
    "OK"
}
