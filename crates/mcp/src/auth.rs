//! Dual authentication for the MCP endpoint.
//!
//! Order matters: a bearer that verifies as an entity-bound JWT with a
//! live `jti` is OAuth-authorized; otherwise the bearer is compared to the
//! entity's bcrypt hash, and on match the encryption key is derived,
//! cached, and any plaintext backlog is retroactively encrypted.

use {
    arachne_bus::{KeyStore, MessageBus},
    arachne_common::{Error, Result, time::now_secs},
    arachne_oauth::jwt,
    arachne_registry::{EntityRecord, Registry, verify_api_key},
    secrecy::Secret,
    tracing::debug,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    OAuth,
    ApiKey,
}

/// A request that passed authentication.
#[derive(Debug)]
pub struct AuthContext {
    pub entity: EntityRecord,
    pub method: AuthMethod,
    /// Present for API-key requests, and for OAuth requests whose key was
    /// primed by an earlier API-key session in this process.
    pub encryption_key: Option<[u8; 32]>,
}

/// The `WWW-Authenticate` challenge for 401 responses. `invalid_token` is
/// included when a bearer was presented but rejected.
#[must_use]
pub fn www_authenticate(base_url: &str, invalid_token: bool) -> String {
    let mut value = format!(
        "Bearer resource_metadata=\"{base_url}/.well-known/oauth-protected-resource\""
    );
    if invalid_token {
        value.push_str(", error=\"invalid_token\"");
    }
    value
}

pub async fn authenticate(
    registry: &Registry,
    keys: &KeyStore,
    bus: &MessageBus,
    jwt_secret: &Secret<String>,
    base_url: &str,
    entity_id: &str,
    bearer: Option<&str>,
) -> Result<AuthContext> {
    let entity = registry
        .get_entity(entity_id)
        .await?
        .filter(|e| e.active)
        .ok_or_else(|| Error::not_found(format!("entity {entity_id}")))?;

    let Some(token) = bearer.filter(|t| !t.is_empty()) else {
        return Err(Error::unauthorized("missing bearer token"));
    };

    // 1. OAuth: signature, expiry, audience, entity binding, live jti.
    if let Ok(claims) = jwt::verify_access_token(jwt_secret, base_url, entity_id, token) {
        if registry
            .is_token_active(&claims.jti, now_secs() as i64)
            .await?
        {
            debug!(entity_id, jti = %claims.jti, "mcp request authorized via oauth");
            return Ok(AuthContext {
                encryption_key: keys.get(entity_id),
                entity,
                method: AuthMethod::OAuth,
            });
        }
        return Err(Error::unauthorized("token revoked"));
    }

    // 2. API key. A fingerprint hit means this exact key already passed
    // bcrypt this session.
    if keys.matches_fingerprint(entity_id, token) {
        return Ok(AuthContext {
            encryption_key: keys.get(entity_id),
            entity,
            method: AuthMethod::ApiKey,
        });
    }
    if verify_api_key(token, &entity.api_key_hash) {
        let key = keys.insert(entity_id, token, &entity.key_salt);
        bus.encrypt_in_place(entity_id, &key);
        debug!(entity_id, "mcp request authorized via api key, encryption key cached");
        return Ok(AuthContext {
            encryption_key: Some(key),
            entity,
            method: AuthMethod::ApiKey,
        });
    }

    Err(Error::unauthorized("invalid bearer token"))
}
