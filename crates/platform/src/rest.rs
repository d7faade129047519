//! Platform REST surface.
//!
//! [`PlatformApi`] carries the calls the core makes itself (webhooks, owner
//! DMs, role lifecycle); [`RestToolBackend`] carries the MCP tools that are
//! thin wrappers over REST endpoints. [`DiscordRest`] implements both
//! against the Discord v10 API.

use {
    arachne_common::{Error, Result},
    async_trait::async_trait,
    reqwest::{Method, StatusCode},
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::debug,
};

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Name given to the shared webhook this process creates per channel.
const WEBHOOK_NAME: &str = "Arachne Relay";

/// A channel webhook the proxy posts through.
#[derive(Debug, Clone, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub token: String,
    pub channel_id: String,
}

/// Mention classes a post may trigger. Text posts allow user mentions;
/// embeds disable all mentions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedMentions {
    Users,
    None,
}

impl AllowedMentions {
    fn to_json(self) -> Value {
        match self {
            Self::Users => json!({ "parse": ["users"] }),
            Self::None => json!({ "parse": [] }),
        }
    }
}

/// One outbound post through a webhook, with the identity override.
/// Webhooks cannot thread (`message_reference` is a platform limitation),
/// so there is deliberately no reply field.
#[derive(Debug, Clone)]
pub struct WebhookPost {
    pub username: String,
    pub avatar_url: Option<String>,
    pub content: Option<String>,
    pub embed: Option<Value>,
    pub file: Option<(String, Vec<u8>)>,
    pub allowed_mentions: AllowedMentions,
}

/// The platform's acknowledgement of a sent message.
#[derive(Debug, Clone, Deserialize)]
pub struct SentMessage {
    pub id: String,
    pub channel_id: String,
}

/// REST calls the core itself performs.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// The bot account's own user id; the router discards its events.
    async fn current_user_id(&self) -> Result<String>;
    /// Find or create the shared webhook for a channel.
    async fn acquire_webhook(&self, channel_id: &str) -> Result<Webhook>;
    async fn execute_webhook(&self, webhook: &Webhook, post: WebhookPost) -> Result<SentMessage>;
    async fn edit_webhook_message(
        &self,
        webhook: &Webhook,
        message_id: &str,
        content: &str,
    ) -> Result<()>;
    /// Open (or reuse) the DM channel with a user and send a message.
    async fn send_dm(&self, user_id: &str, content: &str) -> Result<()>;
    /// Post as the bot itself (join announcements, not entity traffic).
    async fn send_channel_message(&self, channel_id: &str, content: &str) -> Result<()>;
    async fn create_role(&self, server_id: &str, name: &str, color: Option<u32>) -> Result<String>;
    async fn delete_role(&self, server_id: &str, role_id: &str) -> Result<()>;
}

/// MCP tools whose bodies are plain REST wrappers dispatch through this.
#[async_trait]
pub trait RestToolBackend: Send + Sync {
    async fn invoke(&self, tool: &str, args: &Value) -> Result<Value>;
}

// ── Discord implementation ───────────────────────────────────────────────────

pub struct DiscordRest {
    http: reqwest::Client,
    token: Secret<String>,
    api_base: String,
}

impl DiscordRest {
    #[must_use]
    pub fn new(token: Secret<String>) -> Self {
        Self::with_base(token, DISCORD_API_BASE)
    }

    /// Custom API base, for tests against a local mock.
    #[must_use]
    pub fn with_base(token: Secret<String>, api_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{path}", self.api_base);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .header("Authorization", format!("Bot {}", self.token.expose_secret()));
        if let Some(body) = body {
            req = req.json(body);
        }
        let response = req
            .send()
            .await
            .map_err(|e| Error::transient(format!("{method} {path}: {e}")))?;
        Self::decode(method, path, response).await
    }

    async fn decode(method: Method, path: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(Value::Null);
            }
            return response
                .json()
                .await
                .map_err(|e| Error::transient(format!("{method} {path}: invalid body: {e}")));
        }

        let detail = response.text().await.unwrap_or_default();
        debug!(%method, path, %status, %detail, "platform request failed");
        Err(if status == StatusCode::TOO_MANY_REQUESTS {
            Error::transient(format!("{method} {path}: rate limited"))
        } else if status.is_server_error() {
            Error::transient(format!("{method} {path}: {status}"))
        } else if status == StatusCode::NOT_FOUND {
            Error::not_found(format!("platform resource at {path}"))
        } else if status == StatusCode::FORBIDDEN {
            Error::forbidden(format!("platform denied {method} {path}"))
        } else if status == StatusCode::UNAUTHORIZED {
            Error::unauthorized("bot token rejected")
        } else {
            Error::bad_request(format!("{method} {path}: {status}: {detail}"))
        })
    }

    fn webhook_payload(post: &WebhookPost) -> Value {
        let mut payload = json!({
            "username": post.username,
            "allowed_mentions": post.allowed_mentions.to_json(),
        });
        if let Some(avatar) = &post.avatar_url {
            payload["avatar_url"] = Value::String(avatar.clone());
        }
        if let Some(content) = &post.content {
            payload["content"] = Value::String(content.clone());
        }
        if let Some(embed) = &post.embed {
            payload["embeds"] = json!([embed]);
        }
        payload
    }
}

#[async_trait]
impl PlatformApi for DiscordRest {
    async fn current_user_id(&self) -> Result<String> {
        let me = self.request(Method::GET, "/users/@me", None).await?;
        me["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::transient("current-user response missing id"))
    }

    async fn acquire_webhook(&self, channel_id: &str) -> Result<Webhook> {
        let existing = self
            .request(Method::GET, &format!("/channels/{channel_id}/webhooks"), None)
            .await?;
        if let Some(hooks) = existing.as_array() {
            for hook in hooks {
                if hook["name"] == WEBHOOK_NAME && hook["token"].is_string() {
                    return Ok(serde_json::from_value(hook.clone())?);
                }
            }
        }

        let created = self
            .request(
                Method::POST,
                &format!("/channels/{channel_id}/webhooks"),
                Some(&json!({ "name": WEBHOOK_NAME })),
            )
            .await?;
        Ok(serde_json::from_value(created)?)
    }

    async fn execute_webhook(&self, webhook: &Webhook, post: WebhookPost) -> Result<SentMessage> {
        let path = format!("/webhooks/{}/{}?wait=true", webhook.id, webhook.token);
        let payload = Self::webhook_payload(&post);

        let response = if let Some((filename, bytes)) = post.file {
            let form = reqwest::multipart::Form::new()
                .text("payload_json", payload.to_string())
                .part(
                    "files[0]",
                    reqwest::multipart::Part::bytes(bytes).file_name(filename),
                );
            self.http
                .post(format!("{}{path}", self.api_base))
                .multipart(form)
                .send()
                .await
                .map_err(|e| Error::transient(format!("POST {path}: {e}")))?
        } else {
            self.http
                .post(format!("{}{path}", self.api_base))
                .json(&payload)
                .send()
                .await
                .map_err(|e| Error::transient(format!("POST {path}: {e}")))?
        };

        let value = Self::decode(Method::POST, &path, response).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn edit_webhook_message(
        &self,
        webhook: &Webhook,
        message_id: &str,
        content: &str,
    ) -> Result<()> {
        let path = format!(
            "/webhooks/{}/{}/messages/{message_id}",
            webhook.id, webhook.token
        );
        let response = self
            .http
            .patch(format!("{}{path}", self.api_base))
            .json(&json!({ "content": content }))
            .send()
            .await
            .map_err(|e| Error::transient(format!("PATCH {path}: {e}")))?;
        Self::decode(Method::PATCH, &path, response).await?;
        Ok(())
    }

    async fn send_dm(&self, user_id: &str, content: &str) -> Result<()> {
        let channel = self
            .request(
                Method::POST,
                "/users/@me/channels",
                Some(&json!({ "recipient_id": user_id })),
            )
            .await?;
        let channel_id = channel["id"]
            .as_str()
            .ok_or_else(|| Error::transient("DM channel response missing id"))?;
        self.request(
            Method::POST,
            &format!("/channels/{channel_id}/messages"),
            Some(&json!({ "content": content })),
        )
        .await?;
        Ok(())
    }

    async fn send_channel_message(&self, channel_id: &str, content: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/channels/{channel_id}/messages"),
            Some(&json!({ "content": content })),
        )
        .await?;
        Ok(())
    }

    async fn create_role(&self, server_id: &str, name: &str, color: Option<u32>) -> Result<String> {
        let mut body = json!({ "name": name, "mentionable": true });
        if let Some(color) = color {
            body["color"] = json!(color);
        }
        let role = self
            .request(Method::POST, &format!("/guilds/{server_id}/roles"), Some(&body))
            .await?;
        role["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::transient("role response missing id"))
    }

    async fn delete_role(&self, server_id: &str, role_id: &str) -> Result<()> {
        self.request(
            Method::DELETE,
            &format!("/guilds/{server_id}/roles/{role_id}"),
            None,
        )
        .await?;
        Ok(())
    }
}

// ── REST-wrapped tools ───────────────────────────────────────────────────────

fn arg_str<'a>(args: &'a Value, name: &str) -> Result<&'a str> {
    args[name]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::bad_request(format!("missing required argument {name}")))
}

fn arg_u64_or(args: &Value, name: &str, default: u64) -> u64 {
    args[name].as_u64().unwrap_or(default)
}

fn encoded_emoji(args: &Value) -> Result<String> {
    Ok(urlencoding::encode(arg_str(args, "emoji")?).into_owned())
}

#[async_trait]
impl RestToolBackend for DiscordRest {
    async fn invoke(&self, tool: &str, args: &Value) -> Result<Value> {
        match tool {
            // Reading
            "get_channel_history" => {
                let channel = arg_str(args, "channel_id")?;
                let limit = arg_u64_or(args, "limit", 50).min(100);
                self.request(
                    Method::GET,
                    &format!("/channels/{channel}/messages?limit={limit}"),
                    None,
                )
                .await
            },
            "get_message" => {
                let channel = arg_str(args, "channel_id")?;
                let message = arg_str(args, "message_id")?;
                self.request(
                    Method::GET,
                    &format!("/channels/{channel}/messages/{message}"),
                    None,
                )
                .await
            },
            "get_pinned_messages" => {
                let channel = arg_str(args, "channel_id")?;
                self.request(Method::GET, &format!("/channels/{channel}/pins"), None)
                    .await
            },

            // Messaging (the webhook-posting tools live in the MCP core)
            "delete_message" => {
                let channel = arg_str(args, "channel_id")?;
                let message = arg_str(args, "message_id")?;
                self.request(
                    Method::DELETE,
                    &format!("/channels/{channel}/messages/{message}"),
                    None,
                )
                .await
            },
            "pin_message" => {
                let channel = arg_str(args, "channel_id")?;
                let message = arg_str(args, "message_id")?;
                self.request(
                    Method::PUT,
                    &format!("/channels/{channel}/pins/{message}"),
                    None,
                )
                .await
            },
            "unpin_message" => {
                let channel = arg_str(args, "channel_id")?;
                let message = arg_str(args, "message_id")?;
                self.request(
                    Method::DELETE,
                    &format!("/channels/{channel}/pins/{message}"),
                    None,
                )
                .await
            },

            // Reactions
            "add_reaction" => {
                let channel = arg_str(args, "channel_id")?;
                let message = arg_str(args, "message_id")?;
                let emoji = encoded_emoji(args)?;
                self.request(
                    Method::PUT,
                    &format!("/channels/{channel}/messages/{message}/reactions/{emoji}/@me"),
                    None,
                )
                .await
            },
            "remove_reaction" => {
                let channel = arg_str(args, "channel_id")?;
                let message = arg_str(args, "message_id")?;
                let emoji = encoded_emoji(args)?;
                self.request(
                    Method::DELETE,
                    &format!("/channels/{channel}/messages/{message}/reactions/{emoji}/@me"),
                    None,
                )
                .await
            },
            "get_reactions" => {
                let channel = arg_str(args, "channel_id")?;
                let message = arg_str(args, "message_id")?;
                let emoji = encoded_emoji(args)?;
                self.request(
                    Method::GET,
                    &format!("/channels/{channel}/messages/{message}/reactions/{emoji}"),
                    None,
                )
                .await
            },

            // Threads / forums
            "create_thread" => {
                let channel = arg_str(args, "channel_id")?;
                let message = arg_str(args, "message_id")?;
                let name = arg_str(args, "name")?;
                self.request(
                    Method::POST,
                    &format!("/channels/{channel}/messages/{message}/threads"),
                    Some(&json!({ "name": name })),
                )
                .await
            },
            "list_threads" => {
                let server = arg_str(args, "server_id")?;
                self.request(Method::GET, &format!("/guilds/{server}/threads/active"), None)
                    .await
            },
            "create_forum_post" => {
                let channel = arg_str(args, "channel_id")?;
                let name = arg_str(args, "name")?;
                let content = arg_str(args, "content")?;
                self.request(
                    Method::POST,
                    &format!("/channels/{channel}/threads"),
                    Some(&json!({ "name": name, "message": { "content": content } })),
                )
                .await
            },

            // Channel management
            "list_channels" => {
                let server = arg_str(args, "server_id")?;
                self.request(Method::GET, &format!("/guilds/{server}/channels"), None)
                    .await
            },
            "get_channel_info" => {
                let channel = arg_str(args, "channel_id")?;
                self.request(Method::GET, &format!("/channels/{channel}"), None)
                    .await
            },
            "create_channel" => {
                let server = arg_str(args, "server_id")?;
                let name = arg_str(args, "name")?;
                self.request(
                    Method::POST,
                    &format!("/guilds/{server}/channels"),
                    Some(&json!({ "name": name, "type": 0 })),
                )
                .await
            },
            "edit_channel" => {
                let channel = arg_str(args, "channel_id")?;
                let mut body = json!({});
                if let Some(name) = args["name"].as_str() {
                    body["name"] = json!(name);
                }
                if let Some(topic) = args["topic"].as_str() {
                    body["topic"] = json!(topic);
                }
                self.request(Method::PATCH, &format!("/channels/{channel}"), Some(&body))
                    .await
            },
            "delete_channel" => {
                let channel = arg_str(args, "channel_id")?;
                self.request(Method::DELETE, &format!("/channels/{channel}"), None)
                    .await
            },

            // Server
            "list_servers" => self.request(Method::GET, "/users/@me/guilds", None).await,
            "get_server_info" => {
                let server = arg_str(args, "server_id")?;
                self.request(Method::GET, &format!("/guilds/{server}"), None)
                    .await
            },

            // Members / roles
            "list_members" => {
                let server = arg_str(args, "server_id")?;
                let limit = arg_u64_or(args, "limit", 100).min(1000);
                self.request(
                    Method::GET,
                    &format!("/guilds/{server}/members?limit={limit}"),
                    None,
                )
                .await
            },
            "get_member" => {
                let server = arg_str(args, "server_id")?;
                let user = arg_str(args, "user_id")?;
                self.request(Method::GET, &format!("/guilds/{server}/members/{user}"), None)
                    .await
            },
            "list_roles" => {
                let server = arg_str(args, "server_id")?;
                self.request(Method::GET, &format!("/guilds/{server}/roles"), None)
                    .await
            },
            "add_role_to_member" => {
                let server = arg_str(args, "server_id")?;
                let user = arg_str(args, "user_id")?;
                let role = arg_str(args, "role_id")?;
                self.request(
                    Method::PUT,
                    &format!("/guilds/{server}/members/{user}/roles/{role}"),
                    None,
                )
                .await
            },
            "remove_role_from_member" => {
                let server = arg_str(args, "server_id")?;
                let user = arg_str(args, "user_id")?;
                let role = arg_str(args, "role_id")?;
                self.request(
                    Method::DELETE,
                    &format!("/guilds/{server}/members/{user}/roles/{role}"),
                    None,
                )
                .await
            },

            // Utilities
            "get_user_info" => {
                let user = arg_str(args, "user_id")?;
                self.request(Method::GET, &format!("/users/{user}"), None).await
            },

            _ => Err(Error::bad_request(format!("unknown tool {tool}"))),
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn rest(base: &str) -> DiscordRest {
        DiscordRest::with_base(Secret::new("bot-token".to_string()), base)
    }

    #[tokio::test]
    async fn acquire_webhook_reuses_existing() {
        let mut server = mockito::Server::new_async().await;
        let list = server
            .mock("GET", "/channels/c1/webhooks")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!([
                    { "id": "w1", "name": "Arachne Relay", "token": "tok", "channel_id": "c1" }
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let hook = rest(&server.url()).acquire_webhook("c1").await.unwrap();
        assert_eq!(hook.id, "w1");
        assert_eq!(hook.token, "tok");
        list.assert_async().await;
    }

    #[tokio::test]
    async fn acquire_webhook_creates_when_absent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/channels/c1/webhooks")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;
        let create = server
            .mock("POST", "/channels/c1/webhooks")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!(
                    { "id": "w2", "name": "Arachne Relay", "token": "tok2", "channel_id": "c1" }
                )
                .to_string(),
            )
            .create_async()
            .await;

        let hook = rest(&server.url()).acquire_webhook("c1").await.unwrap();
        assert_eq!(hook.id, "w2");
        create.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limit_maps_to_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/channels/c1/messages?limit=50")
            .with_status(429)
            .create_async()
            .await;

        let err = rest(&server.url())
            .invoke("get_channel_history", &serde_json::json!({ "channel_id": "c1" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient { .. }));
    }

    #[tokio::test]
    async fn missing_argument_is_bad_request() {
        let server = mockito::Server::new_async().await;
        let err = rest(&server.url())
            .invoke("get_message", &serde_json::json!({ "channel_id": "c1" }))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let server = mockito::Server::new_async().await;
        let err = rest(&server.url())
            .invoke("summon_demons", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn webhook_payload_carries_identity_override() {
        let payload = DiscordRest::webhook_payload(&WebhookPost {
            username: "Weaver".into(),
            avatar_url: Some("https://cdn.example/a.png?v=1".into()),
            content: Some("hi".into()),
            embed: None,
            file: None,
            allowed_mentions: AllowedMentions::Users,
        });
        assert_eq!(payload["username"], "Weaver");
        assert_eq!(payload["avatar_url"], "https://cdn.example/a.png?v=1");
        assert_eq!(payload["allowed_mentions"]["parse"][0], "users");
    }

    #[test]
    fn embed_posts_disable_all_mentions() {
        let payload = DiscordRest::webhook_payload(&WebhookPost {
            username: "Weaver".into(),
            avatar_url: None,
            content: None,
            embed: Some(serde_json::json!({ "title": "hello" })),
            file: None,
            allowed_mentions: AllowedMentions::None,
        });
        assert_eq!(payload["embeds"][0]["title"], "hello");
        assert!(payload["allowed_mentions"]["parse"].as_array().unwrap().is_empty());
    }
}
