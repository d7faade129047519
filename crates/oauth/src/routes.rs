//! Authorization-server HTTP surface: discovery, dynamic client
//! registration, the PKCE authorization-code flow with the interposed
//! platform identity check and consent page, and the token endpoint.

use std::{collections::HashMap, sync::Arc};

use {
    arachne_common::{Error, Result, time::now_secs},
    arachne_platform::IdentityBroker,
    arachne_registry::{AccessTokenRecord, AuthCodeRecord, RefreshTokenRecord, Registry},
    axum::{
        Json, Router,
        extract::{Form, Query, State},
        http::StatusCode,
        response::{Html, IntoResponse, Redirect, Response},
        routing::{get, post},
    },
    base64::Engine,
    rand::RngCore,
    secrecy::Secret,
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::{info, warn},
    url::Url,
};

use crate::{
    jwt,
    pkce,
    state::{AuthorizeBundle, entity_hint_from_resource},
};

/// Authorization-code lifetime: 10 minutes.
const AUTH_CODE_TTL_SECS: u64 = 10 * 60;
const DEFAULT_SCOPE: &str = "mcp";

/// Everything the authorization server needs; the gateway builds one and
/// mounts [`router`].
pub struct OAuthState {
    pub registry: Registry,
    pub identity: Arc<dyn IdentityBroker>,
    pub jwt_secret: Secret<String>,
    pub base_url: String,
}

impl OAuthState {
    fn callback_uri(&self) -> String {
        format!("{}/oauth/discord-callback", self.base_url)
    }
}

pub fn router(state: Arc<OAuthState>) -> Router {
    Router::new()
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata),
        )
        .route("/oauth/register", post(register))
        .route("/oauth/authorize", get(authorize))
        .route("/oauth/discord-callback", get(discord_callback))
        .route("/oauth/consent", post(consent))
        .route("/oauth/token", post(token))
        .with_state(state)
}

/// RFC 6749 error shape shared by every failure path.
fn oauth_error(status: StatusCode, code: &str, description: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "error": code, "error_description": description.to_string() })),
    )
        .into_response()
}

fn invalid_request(description: impl std::fmt::Display) -> Response {
    oauth_error(StatusCode::BAD_REQUEST, "invalid_request", description)
}

fn invalid_grant(description: impl std::fmt::Display) -> Response {
    oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", description)
}

// ── Discovery ────────────────────────────────────────────────────────────────

async fn protected_resource_metadata(State(state): State<Arc<OAuthState>>) -> Json<Value> {
    Json(json!({
        "resource": state.base_url,
        "authorization_servers": [state.base_url],
        "scopes_supported": [DEFAULT_SCOPE],
        "bearer_methods_supported": ["header"],
    }))
}

async fn authorization_server_metadata(State(state): State<Arc<OAuthState>>) -> Json<Value> {
    let base = &state.base_url;
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/oauth/authorize"),
        "token_endpoint": format!("{base}/oauth/token"),
        "registration_endpoint": format!("{base}/oauth/register"),
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "response_types_supported": ["code"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["none"],
        "scopes_supported": [DEFAULT_SCOPE],
    }))
}

// ── Dynamic client registration (RFC 7591) ───────────────────────────────────

async fn register(State(state): State<Arc<OAuthState>>, Json(body): Json<Value>) -> Response {
    let Some(uris) = body["redirect_uris"].as_array().filter(|u| !u.is_empty()) else {
        return invalid_request("redirect_uris must be a non-empty array");
    };
    let mut redirect_uris = Vec::with_capacity(uris.len());
    for uri in uris {
        let Some(uri) = uri.as_str() else {
            return invalid_request("redirect_uris entries must be strings");
        };
        if Url::parse(uri).is_err() {
            return invalid_request(format!("invalid redirect URI: {uri}"));
        }
        redirect_uris.push(uri.to_string());
    }

    let name = body["client_name"].as_str();
    let grant_types = str_array(
        &body["grant_types"],
        &["authorization_code", "refresh_token"],
    );
    let response_types = str_array(&body["response_types"], &["code"]);
    let auth_method = body["token_endpoint_auth_method"]
        .as_str()
        .unwrap_or("none");

    match state
        .registry
        .create_oauth_client(
            name,
            &redirect_uris,
            &grant_types,
            &response_types,
            auth_method,
            now_secs() as i64,
        )
        .await
    {
        Ok(client) => (
            StatusCode::CREATED,
            Json(json!({
                "client_id": client.id,
                "client_id_issued_at": client.created_at,
                "client_name": client.name,
                "redirect_uris": client.redirect_uris,
                "grant_types": client.grant_types,
                "response_types": client.response_types,
                "token_endpoint_auth_method": client.token_endpoint_auth_method,
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "client registration failed");
            oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e)
        },
    }
}

fn str_array(value: &Value, default: &[&str]) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
}

// ── Authorization ────────────────────────────────────────────────────────────

async fn authorize(
    State(state): State<Arc<OAuthState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(client_id) = params.get("client_id") else {
        return invalid_request("missing client_id");
    };
    let Some(redirect_uri) = params.get("redirect_uri") else {
        return invalid_request("missing redirect_uri");
    };
    if params.get("response_type").map(String::as_str) != Some("code") {
        return invalid_request("response_type must be code");
    }
    let Some(code_challenge) = params.get("code_challenge") else {
        return invalid_request("missing code_challenge");
    };
    let method = params
        .get("code_challenge_method")
        .map(String::as_str)
        .unwrap_or("S256");
    if method != "S256" {
        return invalid_request("only S256 code challenges are supported");
    }

    let client = match state.registry.get_oauth_client(client_id).await {
        Ok(Some(client)) => client,
        Ok(None) => return oauth_error(StatusCode::BAD_REQUEST, "invalid_client", "unknown client"),
        Err(e) => return oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e),
    };
    if !client.redirect_uris.iter().any(|u| u == redirect_uri) {
        return invalid_request("redirect_uri is not registered for this client");
    }

    let bundle = AuthorizeBundle {
        client_id: client_id.clone(),
        redirect_uri: redirect_uri.clone(),
        code_challenge: code_challenge.clone(),
        scope: params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
        client_state: params.get("state").cloned(),
        entity_hint: params
            .get("resource")
            .and_then(|r| entity_hint_from_resource(r)),
    };

    // Interpose the platform identity check before any consent is shown.
    let url = state
        .identity
        .authorize_url(&state.callback_uri(), &bundle.encode());
    Redirect::to(&url).into_response()
}

#[derive(Deserialize)]
struct CallbackParams {
    code: String,
    state: String,
}

async fn discord_callback(
    State(state): State<Arc<OAuthState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let bundle = match AuthorizeBundle::decode(&params.state) {
        Ok(bundle) => bundle,
        Err(e) => return invalid_request(e),
    };

    let user = match verify_platform_identity(&state, &params.code).await {
        Ok(user) => user,
        Err(e) => return error_to_response(e),
    };

    let mut entities = match state.registry.entities_owned_by(&user.id).await {
        Ok(entities) => entities,
        Err(e) => return error_to_response(e),
    };
    if let Some(hint) = &bundle.entity_hint {
        entities.retain(|e| &e.id == hint);
    }
    if entities.is_empty() {
        return oauth_error(
            StatusCode::FORBIDDEN,
            "access_denied",
            "no matching entities are owned by this account",
        );
    }

    let consent_token = match jwt::mint_consent_token(
        &state.jwt_secret,
        &state.base_url,
        &user.id,
        user.display_name(),
    ) {
        Ok(token) => token,
        Err(e) => return error_to_response(e),
    };

    Html(consent_page(
        user.display_name(),
        &entities,
        &params.state,
        &consent_token,
    ))
    .into_response()
}

async fn verify_platform_identity(
    state: &OAuthState,
    code: &str,
) -> Result<arachne_platform::PlatformUser> {
    let access = state
        .identity
        .exchange_code(code, &state.callback_uri())
        .await?;
    state.identity.fetch_user(&access).await
}

fn consent_page(
    user_name: &str,
    entities: &[arachne_registry::EntityRecord],
    bundle: &str,
    consent_token: &str,
) -> String {
    let mut choices = String::new();
    for (i, entity) in entities.iter().enumerate() {
        let checked = if i == 0 { " checked" } else { "" };
        choices.push_str(&format!(
            "<label><input type=\"radio\" name=\"entity_id\" value=\"{}\"{checked}> \
             <strong>{}</strong> <em>({})</em></label><br>\n",
            escape_html(&entity.id),
            escape_html(&entity.name),
            entity.platform.as_str(),
        ));
    }
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\">\
         <title>Arachne — authorize access</title></head><body>\
         <h1>Authorize MCP access</h1>\
         <p>Signed in as <strong>{}</strong>. Choose the entity this client may act as:</p>\
         <form method=\"post\" action=\"/oauth/consent\">\n{choices}\
         <input type=\"hidden\" name=\"bundle\" value=\"{}\">\
         <input type=\"hidden\" name=\"consent\" value=\"{}\">\
         <button type=\"submit\">Authorize</button></form></body></html>",
        escape_html(user_name),
        escape_html(bundle),
        escape_html(consent_token),
    )
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[derive(Deserialize)]
struct ConsentForm {
    entity_id: String,
    bundle: String,
    consent: String,
}

async fn consent(
    State(state): State<Arc<OAuthState>>,
    Form(form): Form<ConsentForm>,
) -> Response {
    let claims =
        match jwt::verify_consent_token(&state.jwt_secret, &state.base_url, &form.consent) {
            Ok(claims) => claims,
            Err(e) => return error_to_response(e),
        };
    let bundle = match AuthorizeBundle::decode(&form.bundle) {
        Ok(bundle) => bundle,
        Err(e) => return error_to_response(e),
    };

    // Ownership is re-verified at submission; the form is client-side data.
    let entity = match state.registry.get_entity(&form.entity_id).await {
        Ok(Some(entity)) if entity.active && entity.owner_id == claims.sub => entity,
        Ok(_) => {
            return oauth_error(
                StatusCode::FORBIDDEN,
                "access_denied",
                "entity is not owned by the authenticated account",
            );
        },
        Err(e) => return error_to_response(e),
    };
    if let Some(hint) = &bundle.entity_hint
        && hint != &entity.id
    {
        return oauth_error(
            StatusCode::FORBIDDEN,
            "access_denied",
            "entity does not match the requested resource",
        );
    }

    let code = opaque_token();
    let record = AuthCodeRecord {
        code: code.clone(),
        client_id: bundle.client_id.clone(),
        entity_id: entity.id.clone(),
        user_id: claims.sub.clone(),
        redirect_uri: bundle.redirect_uri.clone(),
        code_challenge: bundle.code_challenge.clone(),
        scope: bundle.scope.clone(),
        expires_at: (now_secs() + AUTH_CODE_TTL_SECS) as i64,
    };
    if let Err(e) = state.registry.insert_auth_code(&record).await {
        return error_to_response(e);
    }
    info!(entity_id = %entity.id, client_id = %bundle.client_id, "authorization code issued");

    let mut location = format!(
        "{}?code={}",
        bundle.redirect_uri,
        urlencoding::encode(&code)
    );
    if let Some(client_state) = &bundle.client_state {
        location.push_str(&format!("&state={}", urlencoding::encode(client_state)));
    }
    Redirect::to(&location).into_response()
}

// ── Token endpoint ───────────────────────────────────────────────────────────

async fn token(
    State(state): State<Arc<OAuthState>>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    match params.get("grant_type").map(String::as_str) {
        Some("authorization_code") => authorization_code_grant(&state, &params).await,
        Some("refresh_token") => refresh_token_grant(&state, &params).await,
        Some(other) => oauth_error(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            format!("unsupported grant_type {other}"),
        ),
        None => invalid_request("missing grant_type"),
    }
}

async fn authorization_code_grant(
    state: &OAuthState,
    params: &HashMap<String, String>,
) -> Response {
    let (Some(code), Some(redirect_uri), Some(verifier), Some(client_id)) = (
        params.get("code"),
        params.get("redirect_uri"),
        params.get("code_verifier"),
        params.get("client_id"),
    ) else {
        return invalid_request("code, redirect_uri, code_verifier, and client_id are required");
    };

    let consumed = match state
        .registry
        .consume_auth_code(code, now_secs() as i64)
        .await
    {
        Ok(Some(record)) => record,
        Ok(None) => return invalid_grant("authorization code is invalid or expired"),
        Err(e) => return error_to_response(e),
    };

    if &consumed.client_id != client_id {
        return invalid_grant("client_id does not match the authorization code");
    }
    if &consumed.redirect_uri != redirect_uri {
        return invalid_grant("redirect_uri does not match the authorization code");
    }
    if !pkce::verify_s256(verifier, &consumed.code_challenge) {
        return invalid_grant("PKCE verification failed");
    }

    issue_pair(
        state,
        &consumed.entity_id,
        &consumed.user_id,
        &consumed.client_id,
        &consumed.scope,
    )
    .await
}

async fn refresh_token_grant(state: &OAuthState, params: &HashMap<String, String>) -> Response {
    let (Some(refresh_token), Some(client_id)) =
        (params.get("refresh_token"), params.get("client_id"))
    else {
        return invalid_request("refresh_token and client_id are required");
    };

    let consumed = match state
        .registry
        .consume_refresh_token(refresh_token, now_secs() as i64)
        .await
    {
        Ok(Some(record)) => record,
        Ok(None) => return invalid_grant("refresh token is invalid, expired, or already used"),
        Err(e) => return error_to_response(e),
    };
    if &consumed.client_id != client_id {
        return invalid_grant("client_id does not match the refresh token");
    }

    // Rotation: the paired access token dies with the consumed refresh
    // token.
    if let Err(e) = state.registry.revoke_token(&consumed.jti).await {
        return error_to_response(e);
    }

    issue_pair(
        state,
        &consumed.entity_id,
        &consumed.user_id,
        &consumed.client_id,
        &consumed.scope,
    )
    .await
}

async fn issue_pair(
    state: &OAuthState,
    entity_id: &str,
    user_id: &str,
    client_id: &str,
    scope: &str,
) -> Response {
    let (access_token, claims) = match jwt::mint_access_token(
        &state.jwt_secret,
        &state.base_url,
        entity_id,
        user_id,
        client_id,
        scope,
    ) {
        Ok(pair) => pair,
        Err(e) => return error_to_response(e),
    };

    if let Err(e) = state
        .registry
        .record_access_token(&AccessTokenRecord {
            jti: claims.jti.clone(),
            entity_id: entity_id.to_string(),
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            scope: scope.to_string(),
            expires_at: claims.exp as i64,
            revoked: false,
        })
        .await
    {
        return error_to_response(e);
    }

    let refresh_token = opaque_token();
    if let Err(e) = state
        .registry
        .insert_refresh_token(&RefreshTokenRecord {
            token: refresh_token.clone(),
            jti: claims.jti.clone(),
            client_id: client_id.to_string(),
            entity_id: entity_id.to_string(),
            user_id: user_id.to_string(),
            scope: scope.to_string(),
            expires_at: (now_secs() + jwt::REFRESH_TOKEN_TTL_SECS) as i64,
        })
        .await
    {
        return error_to_response(e);
    }

    Json(json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": jwt::ACCESS_TOKEN_TTL_SECS,
        "refresh_token": refresh_token,
        "scope": scope,
    }))
    .into_response()
}

fn opaque_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn error_to_response(e: Error) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let code = if status == StatusCode::UNAUTHORIZED {
        "invalid_client"
    } else if status == StatusCode::FORBIDDEN {
        "access_denied"
    } else if status == StatusCode::BAD_REQUEST {
        "invalid_request"
    } else {
        "server_error"
    };
    oauth_error(status, code, e)
}
