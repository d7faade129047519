//! End-to-end authorization-server tests: register → authorize → identity
//! callback → consent → token, plus the failure shapes the token endpoint
//! must produce.

#![allow(clippy::expect_used)]

use std::{collections::HashMap, sync::Arc};

use {
    arachne_common::Result,
    arachne_oauth::{OAuthState, jwt, pkce, router},
    arachne_platform::{IdentityBroker, PlatformUser},
    arachne_registry::{NewEntity, PlatformTag, Registry},
    async_trait::async_trait,
    axum::{
        Router,
        body::Body,
        http::{Request, StatusCode, header},
    },
    secrecy::Secret,
    serde_json::Value,
    tower::ServiceExt,
};

const BASE: &str = "https://arachne.example";
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

struct MockBroker;

#[async_trait]
impl IdentityBroker for MockBroker {
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "https://platform.test/oauth2/authorize?redirect_uri={}&state={}",
            urlencoding::encode(redirect_uri),
            urlencoding::encode(state),
        )
    }

    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<Secret<String>> {
        if code == "platform-code" {
            Ok(Secret::new("platform-access".to_string()))
        } else {
            Err(arachne_common::Error::unauthorized("bad platform code"))
        }
    }

    async fn fetch_user(&self, _access_token: &Secret<String>) -> Result<PlatformUser> {
        Ok(PlatformUser {
            id: "owner-1".into(),
            username: "ada".into(),
            global_name: Some("Ada".into()),
        })
    }
}

struct Harness {
    app: Router,
    registry: Registry,
    entity_id: String,
}

async fn harness() -> Harness {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:")
        .await
        .expect("pool");
    let registry = Registry::with_pool(pool).await.expect("registry");
    let (entity, _) = registry
        .create_entity(NewEntity {
            name: "Weaver".into(),
            avatar_url: None,
            description: None,
            accent_color: None,
            platform: PlatformTag::Claude,
            owner_id: "owner-1".into(),
            owner_name: "Ada".into(),
        })
        .await
        .expect("entity");

    let state = Arc::new(OAuthState {
        registry: registry.clone(),
        identity: Arc::new(MockBroker),
        jwt_secret: Secret::new("test-jwt-secret".to_string()),
        base_url: BASE.to_string(),
    });
    Harness {
        app: router(state),
        registry,
        entity_id: entity.id,
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

async fn register_client(app: &Router) -> String {
    let response = app
        .clone()
        .oneshot(
            Request::post("/oauth/register")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "client_name": "Test MCP Client",
                        "redirect_uris": ["https://client.example/cb"],
                    })
                    .to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    body["client_id"].as_str().expect("client_id").to_string()
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name)
            .then(|| urlencoding::decode(v).ok().map(|s| s.into_owned()))
            .flatten()
    })
}

fn form_value(html: &str, field: &str) -> String {
    let marker = format!("name=\"{field}\" value=\"");
    let start = html.find(&marker).expect("form field") + marker.len();
    let end = html[start..].find('"').expect("closing quote") + start;
    html[start..end].to_string()
}

/// Drive register → authorize → callback → consent; returns the issued
/// authorization code.
async fn obtain_code(h: &Harness, client_id: &str) -> String {
    let challenge = pkce::challenge_s256(VERIFIER);
    let authorize_uri = format!(
        "/oauth/authorize?client_id={client_id}&redirect_uri={}&response_type=code\
         &code_challenge={challenge}&code_challenge_method=S256&state=client-xyz\
         &resource={}",
        urlencoding::encode("https://client.example/cb"),
        urlencoding::encode(&format!("{BASE}/mcp/{}", h.entity_id)),
    );
    let response = h
        .app
        .clone()
        .oneshot(Request::get(authorize_uri.as_str()).body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert!(response.status().is_redirection());
    let location = response.headers()[header::LOCATION]
        .to_str()
        .expect("location")
        .to_string();
    assert!(location.starts_with("https://platform.test/oauth2/authorize"));
    let platform_state = query_param(&location, "state").expect("state param");

    let response = h
        .app
        .clone()
        .oneshot(
            Request::get(format!(
                "/oauth/discord-callback?code=platform-code&state={}",
                urlencoding::encode(&platform_state)
            ))
            .body(Body::empty())
            .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let page = body_text(response).await;
    assert!(page.contains("Weaver"));
    let bundle = form_value(&page, "bundle");
    let consent = form_value(&page, "consent");

    let form = format!(
        "entity_id={}&bundle={}&consent={}",
        urlencoding::encode(&h.entity_id),
        urlencoding::encode(&bundle),
        urlencoding::encode(&consent),
    );
    let response = h
        .app
        .clone()
        .oneshot(
            Request::post("/oauth/consent")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .expect("request"),
        )
        .await
        .expect("response");
    assert!(response.status().is_redirection());
    let location = response.headers()[header::LOCATION]
        .to_str()
        .expect("location")
        .to_string();
    assert!(location.starts_with("https://client.example/cb?"));
    assert_eq!(query_param(&location, "state").as_deref(), Some("client-xyz"));
    query_param(&location, "code").expect("authorization code")
}

async fn token_request(app: &Router, fields: &[(&str, &str)]) -> axum::response::Response {
    let body = fields
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    app.clone()
        .oneshot(
            Request::post("/oauth/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .expect("request"),
        )
        .await
        .expect("response")
}

#[tokio::test]
async fn discovery_documents_advertise_the_flow() {
    let h = harness().await;

    let response = h
        .app
        .clone()
        .oneshot(
            Request::get("/.well-known/oauth-protected-resource")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["resource"], BASE);
    assert_eq!(body["authorization_servers"][0], BASE);

    let response = h
        .app
        .clone()
        .oneshot(
            Request::get("/.well-known/oauth-authorization-server")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let body = body_json(response).await;
    assert_eq!(body["issuer"], BASE);
    assert_eq!(body["code_challenge_methods_supported"][0], "S256");
    assert_eq!(body["grant_types_supported"][1], "refresh_token");
    assert_eq!(body["token_endpoint_auth_methods_supported"][0], "none");
}

#[tokio::test]
async fn registration_validates_redirect_uris() {
    let h = harness().await;

    let response = h
        .app
        .clone()
        .oneshot(
            Request::post("/oauth/register")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"redirect_uris": []}"#))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_request");

    let response = h
        .app
        .clone()
        .oneshot(
            Request::post("/oauth/register")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"redirect_uris": ["not a url"]}"#))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn authorize_rejects_plain_pkce() {
    let h = harness().await;
    let client_id = register_client(&h.app).await;
    let uri = format!(
        "/oauth/authorize?client_id={client_id}&redirect_uri={}&response_type=code\
         &code_challenge=x&code_challenge_method=plain",
        urlencoding::encode("https://client.example/cb"),
    );
    let response = h
        .app
        .clone()
        .oneshot(Request::get(uri.as_str()).body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn full_code_flow_issues_a_valid_access_token() {
    let h = harness().await;
    let client_id = register_client(&h.app).await;
    let code = obtain_code(&h, &client_id).await;

    let response = token_request(&h.app, &[
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", "https://client.example/cb"),
        ("code_verifier", VERIFIER),
        ("client_id", &client_id),
    ])
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 3600);
    assert_eq!(body["scope"], "mcp");
    assert!(body["refresh_token"].is_string());

    let access = body["access_token"].as_str().expect("access token");
    let claims = jwt::verify_access_token(
        &Secret::new("test-jwt-secret".to_string()),
        BASE,
        &h.entity_id,
        access,
    )
    .expect("valid claims");
    assert_eq!(claims.sub, "owner-1");
    assert_eq!(claims.entity_id, h.entity_id);
    assert!(
        h.registry
            .is_token_active(&claims.jti, arachne_common::time::now_secs() as i64)
            .await
            .expect("jti lookup")
    );
}

#[tokio::test]
async fn altered_verifier_redirect_or_client_is_invalid_grant() {
    let h = harness().await;
    let client_id = register_client(&h.app).await;

    // Wrong verifier.
    let code = obtain_code(&h, &client_id).await;
    let response = token_request(&h.app, &[
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", "https://client.example/cb"),
        ("code_verifier", "wrong"),
        ("client_id", &client_id),
    ])
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_grant");

    // Wrong redirect URI.
    let code = obtain_code(&h, &client_id).await;
    let response = token_request(&h.app, &[
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", "https://evil.example/cb"),
        ("code_verifier", VERIFIER),
        ("client_id", &client_id),
    ])
    .await;
    assert_eq!(body_json(response).await["error"], "invalid_grant");

    // Wrong client id.
    let code = obtain_code(&h, &client_id).await;
    let response = token_request(&h.app, &[
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", "https://client.example/cb"),
        ("code_verifier", VERIFIER),
        ("client_id", "someone-else"),
    ])
    .await;
    assert_eq!(body_json(response).await["error"], "invalid_grant");
}

#[tokio::test]
async fn authorization_code_is_single_use() {
    let h = harness().await;
    let client_id = register_client(&h.app).await;
    let code = obtain_code(&h, &client_id).await;

    let fields = [
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("redirect_uri", "https://client.example/cb"),
        ("code_verifier", VERIFIER),
        ("client_id", client_id.as_str()),
    ];
    let first = token_request(&h.app, &fields).await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = token_request(&h.app, &fields).await;
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(second).await["error"], "invalid_grant");
}

#[tokio::test]
async fn refresh_rotation_revokes_and_rotates() {
    let h = harness().await;
    let client_id = register_client(&h.app).await;
    let code = obtain_code(&h, &client_id).await;

    let response = token_request(&h.app, &[
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", "https://client.example/cb"),
        ("code_verifier", VERIFIER),
        ("client_id", &client_id),
    ])
    .await;
    let first = body_json(response).await;
    let refresh1 = first["refresh_token"].as_str().expect("refresh").to_string();
    let access1 = first["access_token"].as_str().expect("access");
    let secret = Secret::new("test-jwt-secret".to_string());
    let jti1 = jwt::verify_access_token(&secret, BASE, &h.entity_id, access1)
        .expect("claims")
        .jti;

    let response = token_request(&h.app, &[
        ("grant_type", "refresh_token"),
        ("refresh_token", &refresh1),
        ("client_id", &client_id),
    ])
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let second = body_json(response).await;
    assert_ne!(second["refresh_token"], first["refresh_token"]);
    assert_ne!(second["access_token"], first["access_token"]);

    // The first access token's jti is revoked by rotation.
    let now = arachne_common::time::now_secs() as i64;
    assert!(!h.registry.is_token_active(&jti1, now).await.expect("jti"));

    // The consumed refresh token is dead on any later use.
    let response = token_request(&h.app, &[
        ("grant_type", "refresh_token"),
        ("refresh_token", &refresh1),
        ("client_id", &client_id),
    ])
    .await;
    assert_eq!(body_json(response).await["error"], "invalid_grant");
}

#[tokio::test]
async fn entity_hint_mismatch_is_denied() {
    let h = harness().await;
    let client_id = register_client(&h.app).await;
    let challenge = pkce::challenge_s256(VERIFIER);

    // Hint at an entity the signed-in user does not own.
    let authorize_uri = format!(
        "/oauth/authorize?client_id={client_id}&redirect_uri={}&response_type=code\
         &code_challenge={challenge}&resource={}",
        urlencoding::encode("https://client.example/cb"),
        urlencoding::encode(&format!("{BASE}/mcp/not-owned")),
    );
    let response = h
        .app
        .clone()
        .oneshot(Request::get(authorize_uri.as_str()).body(Body::empty()).expect("request"))
        .await
        .expect("response");
    let location = response.headers()[header::LOCATION]
        .to_str()
        .expect("location")
        .to_string();
    let platform_state = query_param(&location, "state").expect("state");

    let response = h
        .app
        .clone()
        .oneshot(
            Request::get(format!(
                "/oauth/discord-callback?code=platform-code&state={}",
                urlencoding::encode(&platform_state)
            ))
            .body(Body::empty())
            .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unsupported_grant_type_is_named() {
    let h = harness().await;
    let response = token_request(&h.app, &[("grant_type", "password")]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "unsupported_grant_type");
}
