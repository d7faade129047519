//! HS256 token minting and verification.
//!
//! One process-wide secret signs three audiences: MCP access tokens
//! (`<base>/mcp/<entity>`), dashboard session tokens (`<base>/dashboard`),
//! and short-lived consent-form tokens (`<base>/consent`). The audience is
//! checked on every verification path so tokens never cross surfaces.

use {
    arachne_common::{Error, Result, time::now_secs},
    jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

pub const ACCESS_TOKEN_TTL_SECS: u64 = 3600;
pub const REFRESH_TOKEN_TTL_SECS: u64 = 30 * 24 * 3600;
pub const SESSION_TOKEN_TTL_SECS: u64 = 7 * 24 * 3600;
const CONSENT_TOKEN_TTL_SECS: u64 = 10 * 60;

/// Claims of an MCP access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: u64,
    pub iat: u64,
    pub jti: String,
    pub scope: String,
    pub entity_id: String,
    pub client_id: String,
}

/// Claims of a dashboard session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: u64,
    pub iat: u64,
}

/// Claims of the short-lived token that binds a consent form to the
/// platform user who passed the identity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: u64,
    pub user_name: String,
}

pub fn mint_access_token(
    secret: &Secret<String>,
    base_url: &str,
    entity_id: &str,
    user_id: &str,
    client_id: &str,
    scope: &str,
) -> Result<(String, AccessClaims)> {
    let now = now_secs();
    let claims = AccessClaims {
        iss: base_url.to_string(),
        sub: user_id.to_string(),
        aud: format!("{base_url}/mcp/{entity_id}"),
        exp: now + ACCESS_TOKEN_TTL_SECS,
        iat: now,
        jti: uuid::Uuid::new_v4().to_string(),
        scope: scope.to_string(),
        entity_id: entity_id.to_string(),
        client_id: client_id.to_string(),
    };
    let token = sign(secret, &claims)?;
    Ok((token, claims))
}

/// Verify an access token against the entity-scoped audience. Signature,
/// expiry, audience, and the embedded entity id must all line up.
pub fn verify_access_token(
    secret: &Secret<String>,
    base_url: &str,
    entity_id: &str,
    token: &str,
) -> Result<AccessClaims> {
    let claims: AccessClaims = check(secret, token, &format!("{base_url}/mcp/{entity_id}"))?;
    if claims.entity_id != entity_id {
        return Err(Error::unauthorized("token bound to a different entity"));
    }
    Ok(claims)
}

pub fn mint_session_token(
    secret: &Secret<String>,
    base_url: &str,
    user_id: &str,
) -> Result<String> {
    let now = now_secs();
    let claims = SessionClaims {
        iss: base_url.to_string(),
        sub: user_id.to_string(),
        aud: format!("{base_url}/dashboard"),
        exp: now + SESSION_TOKEN_TTL_SECS,
        iat: now,
    };
    sign(secret, &claims)
}

pub fn verify_session_token(
    secret: &Secret<String>,
    base_url: &str,
    token: &str,
) -> Result<SessionClaims> {
    check(secret, token, &format!("{base_url}/dashboard"))
}

pub fn mint_consent_token(
    secret: &Secret<String>,
    base_url: &str,
    user_id: &str,
    user_name: &str,
) -> Result<String> {
    let claims = ConsentClaims {
        iss: base_url.to_string(),
        sub: user_id.to_string(),
        aud: format!("{base_url}/consent"),
        exp: now_secs() + CONSENT_TOKEN_TTL_SECS,
        user_name: user_name.to_string(),
    };
    sign(secret, &claims)
}

pub fn verify_consent_token(
    secret: &Secret<String>,
    base_url: &str,
    token: &str,
) -> Result<ConsentClaims> {
    check(secret, token, &format!("{base_url}/consent"))
}

fn sign<C: Serialize>(secret: &Secret<String>, claims: &C) -> Result<String> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.expose_secret().as_bytes()),
    )
    .map_err(|e| Error::fatal("signing token", e))
}

fn check<C: serde::de::DeserializeOwned>(
    secret: &Secret<String>,
    token: &str,
    audience: &str,
) -> Result<C> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[audience]);
    decode::<C>(
        token,
        &DecodingKey::from_secret(secret.expose_secret().as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| Error::unauthorized(format!("invalid token: {e}")))
}
