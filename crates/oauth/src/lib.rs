//! OAuth 2.1 authorization server for entity-scoped MCP access.
//!
//! Discovery (RFC 8414 / 9728), dynamic client registration (RFC 7591),
//! and a PKCE-S256 authorization-code flow that interposes a platform
//! identity check before consent. Access tokens are HS256 JWTs audience-
//! bound to one entity's MCP endpoint; refresh tokens are opaque,
//! single-use, and rotate the access token's `jti`.

pub mod jwt;
pub mod pkce;
pub mod routes;
pub mod state;

pub use routes::{OAuthState, router};
