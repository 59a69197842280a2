//! # HTTP Gateway
//!
//! Exposes the analysis pipeline over HTTP: one analysis endpoint, a health
//! endpoint that also checks the knowledge retriever, and a banner route.
//! Requests are authenticated with static tokens from `[server]` config.

mod auth;
mod server;

pub use auth::GatewayAuth;
pub use server::{ErrorBody, GatewayServer, SharedGateway, router as gateway_router, run as run_gateway};
