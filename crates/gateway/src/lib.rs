//! Gateway: WebSocket/HTTP server, protocol dispatch and admission control.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Open transcripts, wire sessions, decisions, hooks and channels
//! 3. Start the event bus, tick and cron loops
//! 4. Serve `/health` and the `/ws` frame protocol
//!
//! Domain logic lives in the other crates and is reached through the method
//! handlers registered in `methods.rs`.

pub mod auth;
pub mod chat;
pub mod cron;
pub mod events;
pub mod idempotency;
pub mod methods;
pub mod rate_limit;
pub mod server;
pub mod state;
pub mod tools;
pub mod ws;

pub use {
    methods::{MethodContext, MethodRegistry, MethodResult},
    server::{Gateway, GatewayBuilder, build_gateway_app, start_gateway},
    state::{GatewayServices, GatewayState},
};
