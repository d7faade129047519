//! HTTP surface: the per-entity MCP route, health, and the dashboard API
//! behind session-token auth. The OAuth routes are merged in by the
//! assembly in `lib.rs`.

use std::sync::Arc;

use {
    arachne_common::Error,
    arachne_mcp::{types::INTERNAL_ERROR, JsonRpcResponse, www_authenticate},
    arachne_oauth::jwt::{self, SessionClaims},
    arachne_registry::{NewEntity, PlatformTag},
    axum::{
        Extension, Json, Router,
        extract::{Path, Request, State},
        http::{HeaderMap, StatusCode, header},
        middleware::{self, Next},
        response::{IntoResponse, Response},
        routing::{delete, get, post},
    },
    serde::Deserialize,
    serde_json::{Value, json},
};

use crate::{ops, state::AppContext};

pub fn router(ctx: Arc<AppContext>) -> Router {
    let api = Router::new()
        .route("/api/me", get(me))
        .route("/api/entities", get(list_entities).post(create_entity))
        .route("/api/entities/{entity_id}/regenerate-key", post(regenerate_key))
        .route("/api/entities/{entity_id}/deactivate", post(deactivate_entity))
        .route("/api/entities/{entity_id}", delete(delete_entity))
        .route("/api/requests/{request_id}/approve", post(approve_request))
        .route("/api/requests/{request_id}/reject", post(reject_request))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&ctx),
            require_session,
        ));

    Router::new()
        .route(
            "/mcp/{entity_id}",
            post(post_mcp).get(get_mcp).delete(delete_mcp),
        )
        .route("/health", get(health))
        .merge(api)
        .with_state(ctx)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn error_response(e: &Error) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

// ── MCP ──────────────────────────────────────────────────────────────────────

async fn post_mcp(
    State(ctx): State<Arc<AppContext>>,
    Path(entity_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let token = bearer(&headers);
    match ctx.mcp.handle(&entity_id, token, body).await {
        Ok(Some(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(e) if e.http_status() == 401 => (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                www_authenticate(&ctx.config.base_url, token.is_some()),
            )],
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e) if e.http_status() == 404 => error_response(&e),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(JsonRpcResponse::error(
                Value::Null,
                INTERNAL_ERROR,
                e.to_string(),
            )),
        )
            .into_response(),
    }
}

/// Stateless mode: no SSE stream to offer.
async fn get_mcp() -> StatusCode {
    StatusCode::METHOD_NOT_ALLOWED
}

/// Stateless mode: there is no session to tear down.
async fn delete_mcp() -> Response {
    (StatusCode::OK, Json(json!({}))).into_response()
}

// ── Health ───────────────────────────────────────────────────────────────────

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "queues": ctx.bus.stats(),
    }))
}

// ── Dashboard API (session-token auth) ───────────────────────────────────────

/// Dashboard requests authenticate with a session JWT signed by the same
/// secret as OAuth access tokens; the audience check keeps the two apart,
/// and entity API keys are never accepted here.
async fn require_session(
    State(ctx): State<Arc<AppContext>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer(request.headers()) else {
        return error_response(&Error::unauthorized("missing session token"));
    };
    match jwt::verify_session_token(&ctx.config.jwt_secret, &ctx.config.base_url, token) {
        Ok(claims) => {
            request.extensions_mut().insert(claims);
            next.run(request).await
        },
        Err(e) => error_response(&e),
    }
}

fn is_operator(ctx: &AppContext, claims: &SessionClaims) -> bool {
    ctx.config.operator_ids.iter().any(|id| id == &claims.sub)
}

async fn me(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<SessionClaims>,
) -> Json<Value> {
    Json(json!({
        "user_id": claims.sub,
        "operator": is_operator(&ctx, &claims),
    }))
}

async fn list_entities(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<SessionClaims>,
) -> Response {
    match ctx.registry.entities_owned_by(&claims.sub).await {
        Ok(entities) => Json(json!({ "entities": entities })).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct CreateEntityBody {
    name: String,
    avatar_url: Option<String>,
    description: Option<String>,
    accent_color: Option<String>,
    platform: Option<PlatformTag>,
}

async fn create_entity(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<SessionClaims>,
    Json(body): Json<CreateEntityBody>,
) -> Response {
    if body.name.trim().is_empty() {
        return error_response(&Error::bad_request("entity name must not be empty"));
    }
    let new = NewEntity {
        name: body.name,
        avatar_url: body.avatar_url,
        description: body.description,
        accent_color: body.accent_color,
        platform: body.platform.unwrap_or(PlatformTag::Other),
        owner_id: claims.sub.clone(),
        owner_name: String::new(),
    };
    match ctx.registry.create_entity(new).await {
        // The raw key appears in this response and never again.
        Ok((entity, api_key)) => (
            StatusCode::CREATED,
            Json(json!({ "entity": entity, "api_key": api_key })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Owner or operator.
async fn authorize_entity_access(
    ctx: &AppContext,
    claims: &SessionClaims,
    entity_id: &str,
) -> Result<(), Error> {
    let entity = ctx.registry.require_entity(entity_id).await?;
    if entity.owner_id != claims.sub && !is_operator(ctx, claims) {
        return Err(Error::forbidden("not this entity's owner"));
    }
    Ok(())
}

async fn regenerate_key(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<SessionClaims>,
    Path(entity_id): Path<String>,
) -> Response {
    if let Err(e) = authorize_entity_access(&ctx, &claims, &entity_id).await {
        return error_response(&e);
    }
    match ops::regenerate_api_key(&ctx, &entity_id).await {
        Ok(api_key) => Json(json!({ "api_key": api_key })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn deactivate_entity(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<SessionClaims>,
    Path(entity_id): Path<String>,
) -> Response {
    if let Err(e) = authorize_entity_access(&ctx, &claims, &entity_id).await {
        return error_response(&e);
    }
    match ops::deactivate_entity(&ctx, &entity_id).await {
        Ok(()) => Json(json!({ "deactivated": true })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn delete_entity(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<SessionClaims>,
    Path(entity_id): Path<String>,
) -> Response {
    if let Err(e) = authorize_entity_access(&ctx, &claims, &entity_id).await {
        return error_response(&e);
    }
    match ops::delete_entity(&ctx, &entity_id).await {
        Ok(()) => Json(json!({ "deleted": true })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn approve_request(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<SessionClaims>,
    Path(request_id): Path<String>,
) -> Response {
    if !is_operator(&ctx, &claims) {
        return error_response(&Error::forbidden("operator rights required"));
    }
    match ops::approve_request(&ctx, &request_id, &claims.sub).await {
        Ok(request) => Json(json!({ "request": request })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn reject_request(
    State(ctx): State<Arc<AppContext>>,
    Extension(claims): Extension<SessionClaims>,
    Path(request_id): Path<String>,
) -> Response {
    if !is_operator(&ctx, &claims) {
        return error_response(&Error::forbidden("operator rights required"));
    }
    match ops::reject_request(&ctx, &request_id, &claims.sub).await {
        Ok(request) => Json(json!({ "request": request })).into_response(),
        Err(e) => error_response(&e),
    }
}
