//! Owner-identity verification against the platform's own OAuth.
//!
//! The authorization server interposes a `scope=identify` round trip to
//! Discord before showing the consent page; this module is that round
//! trip.

use {
    arachne_common::{Error, Result},
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
};

/// The authenticated platform user behind a consent flow.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
}

impl PlatformUser {
    /// Preferred display name for caching next to ids.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }
}

/// Platform side of the identity check, mockable in tests.
#[async_trait]
pub trait IdentityBroker: Send + Sync {
    /// Where to send the user for `response_type=code scope=identify`.
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String;
    /// Exchange the platform code for a platform access token.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Secret<String>>;
    /// Fetch the authenticated user's profile.
    async fn fetch_user(&self, access_token: &Secret<String>) -> Result<PlatformUser>;
}

pub struct DiscordIdentityBroker {
    http: reqwest::Client,
    client_id: String,
    client_secret: Secret<String>,
    api_base: String,
}

impl DiscordIdentityBroker {
    #[must_use]
    pub fn new(client_id: String, client_secret: Secret<String>) -> Self {
        Self::with_base(client_id, client_secret, super::rest::DISCORD_API_BASE)
    }

    #[must_use]
    pub fn with_base(client_id: String, client_secret: Secret<String>, api_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id,
            client_secret,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[async_trait]
impl IdentityBroker for DiscordIdentityBroker {
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}/oauth2/authorize?client_id={}&response_type=code&scope=identify&redirect_uri={}&state={}",
            self.api_base,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(state),
        )
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Secret<String>> {
        let response = self
            .http
            .post(format!("{}/oauth2/token", self.api_base))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await
            .map_err(|e| Error::transient(format!("platform token exchange: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::unauthorized("platform rejected the authorization code"));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::transient(format!("platform token response: {e}")))?;
        Ok(Secret::new(body.access_token))
    }

    async fn fetch_user(&self, access_token: &Secret<String>) -> Result<PlatformUser> {
        let response = self
            .http
            .get(format!("{}/users/@me", self.api_base))
            .bearer_auth(access_token.expose_secret())
            .send()
            .await
            .map_err(|e| Error::transient(format!("platform profile fetch: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::unauthorized("platform access token rejected"));
        }
        response
            .json()
            .await
            .map_err(|e| Error::transient(format!("platform profile response: {e}")))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn broker(base: &str) -> DiscordIdentityBroker {
        DiscordIdentityBroker::with_base(
            "app-1".into(),
            Secret::new("app-secret".to_string()),
            base,
        )
    }

    #[test]
    fn authorize_url_carries_identify_scope() {
        let url = broker("https://discord.test/api").authorize_url(
            "https://arachne.example/oauth/discord-callback",
            "opaque-state",
        );
        assert!(url.contains("scope=identify"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("state=opaque-state"));
        assert!(url.contains(&urlencoding::encode(
            "https://arachne.example/oauth/discord-callback"
        ).into_owned()));
    }

    #[tokio::test]
    async fn exchange_and_fetch_roundtrip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"platform-token","token_type":"Bearer"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/users/@me")
            .match_header("authorization", "Bearer platform-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"42","username":"ada","global_name":"Ada"}"#)
            .create_async()
            .await;

        let broker = broker(&server.url());
        let token = broker.exchange_code("abc", "https://cb.example").await.unwrap();
        let user = broker.fetch_user(&token).await.unwrap();
        assert_eq!(user.id, "42");
        assert_eq!(user.display_name(), "Ada");
    }

    #[tokio::test]
    async fn rejected_code_is_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(400)
            .create_async()
            .await;

        let err = broker(&server.url())
            .exchange_code("bad", "https://cb.example")
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 401);
    }
}
