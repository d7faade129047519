//! Entity-scoped MCP endpoint: dual authentication (OAuth JWT or API
//! key), a centralized capability gate, and a stateless per-request tool
//! server over JSON-RPC.

pub mod auth;
pub mod catalog;
pub mod gate;
pub mod server;
pub mod types;

pub use {
    auth::{AuthContext, AuthMethod, authenticate, www_authenticate},
    gate::Capabilities,
    server::McpService,
    types::{JsonRpcResponse, PROTOCOL_VERSION},
};
