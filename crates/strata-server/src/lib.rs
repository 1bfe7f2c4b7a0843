//! # strata-server
//!
//! JSON-RPC over WebSocket for `ContextService`, plus `/health` over HTTP.
//! Subscription events are pushed to the subscribing connection as
//! `{"type":"event", ...}` frames.

pub mod client;
pub mod event_bridge;
pub mod handlers;
pub mod rpc;
pub mod server;

pub use server::{start, start_with_telemetry, ServerConfig, ServerHandle};
