use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use {
    arachne_common::{Error, Result, time::now_ms},
    arachne_platform::{AllowedMentions, PlatformApi, SentMessage, Webhook, WebhookPost},
    futures::{FutureExt, future::{BoxFuture, Shared}},
    serde_json::Value,
    tracing::debug,
};

use crate::attribution::Attribution;

/// The identity a post is rendered under.
#[derive(Debug, Clone)]
pub struct EntityIdentity {
    pub entity_id: String,
    pub name: String,
    pub avatar_url: Option<String>,
}

type AcquireFuture = Shared<BoxFuture<'static, std::result::Result<Webhook, Arc<Error>>>>;

/// Lazily acquires one shared webhook per channel and posts through it with
/// a per-call identity override. Concurrent posts to an unseen channel
/// coalesce on one in-flight acquisition.
pub struct WebhookProxy {
    api: Arc<dyn PlatformApi>,
    hooks: RwLock<HashMap<String, Webhook>>,
    pending: Mutex<HashMap<String, AcquireFuture>>,
    attribution: Arc<Attribution>,
}

impl WebhookProxy {
    #[must_use]
    pub fn new(api: Arc<dyn PlatformApi>, attribution: Arc<Attribution>) -> Self {
        Self {
            api,
            hooks: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            attribution,
        }
    }

    pub async fn send_text(
        &self,
        identity: &EntityIdentity,
        channel_id: &str,
        content: &str,
    ) -> Result<SentMessage> {
        self.post(identity, channel_id, WebhookPost {
            username: identity.name.clone(),
            avatar_url: busted_avatar(identity),
            content: Some(content.to_string()),
            embed: None,
            file: None,
            allowed_mentions: AllowedMentions::Users,
        })
        .await
    }

    pub async fn send_file(
        &self,
        identity: &EntityIdentity,
        channel_id: &str,
        filename: &str,
        bytes: Vec<u8>,
        content: Option<&str>,
    ) -> Result<SentMessage> {
        self.post(identity, channel_id, WebhookPost {
            username: identity.name.clone(),
            avatar_url: busted_avatar(identity),
            content: content.map(str::to_string),
            embed: None,
            file: Some((filename.to_string(), bytes)),
            allowed_mentions: AllowedMentions::Users,
        })
        .await
    }

    pub async fn send_embed(
        &self,
        identity: &EntityIdentity,
        channel_id: &str,
        embed: Value,
    ) -> Result<SentMessage> {
        self.post(identity, channel_id, WebhookPost {
            username: identity.name.clone(),
            avatar_url: busted_avatar(identity),
            content: None,
            embed: Some(embed),
            file: None,
            allowed_mentions: AllowedMentions::None,
        })
        .await
    }

    /// Edit a message previously posted through this channel's webhook.
    pub async fn edit(&self, channel_id: &str, message_id: &str, content: &str) -> Result<()> {
        let webhook = self.webhook_for(channel_id).await?;
        self.api
            .edit_webhook_message(&webhook, message_id, content)
            .await
    }

    /// Which entity a message id belongs to, if we posted it recently.
    #[must_use]
    pub fn attribute(&self, message_id: &str) -> Option<String> {
        self.attribution.entity_for(message_id)
    }

    async fn post(
        &self,
        identity: &EntityIdentity,
        channel_id: &str,
        post: WebhookPost,
    ) -> Result<SentMessage> {
        let webhook = self.webhook_for(channel_id).await?;
        let sent = self.api.execute_webhook(&webhook, post).await?;
        self.attribution.record(&sent.id, &identity.entity_id);
        Ok(sent)
    }

    async fn webhook_for(&self, channel_id: &str) -> Result<Webhook> {
        if let Some(hook) = self
            .hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel_id)
            .cloned()
        {
            return Ok(hook);
        }

        // One producer per channel: later callers await the same future.
        let future = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.get(channel_id) {
                Some(future) => future.clone(),
                None => {
                    let api = Arc::clone(&self.api);
                    let channel = channel_id.to_string();
                    let future: AcquireFuture = async move {
                        api.acquire_webhook(&channel).await.map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    pending.insert(channel_id.to_string(), future.clone());
                    debug!(channel_id, "acquiring channel webhook");
                    future
                },
            }
        };

        let result = future.await;
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel_id);

        match result {
            Ok(webhook) => {
                self.hooks
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(channel_id.to_string(), webhook.clone());
                Ok(webhook)
            },
            Err(e) => Err(Error::transient(format!(
                "webhook acquisition for channel {channel_id}: {e}"
            ))),
        }
    }
}

/// Append a cache-busting query parameter: the platform caches webhook
/// avatars aggressively, and a changing URL is the only reliable refresh.
fn busted_avatar(identity: &EntityIdentity) -> Option<String> {
    identity.avatar_url.as_ref().map(|url| {
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{url}{sep}v={}", now_ms())
    })
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use {async_trait::async_trait, std::time::Duration};

    use super::*;

    struct MockApi {
        acquires: AtomicUsize,
        posts: Mutex<Vec<WebhookPost>>,
    }

    impl MockApi {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                acquires: AtomicUsize::new(0),
                posts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PlatformApi for MockApi {
        async fn current_user_id(&self) -> Result<String> {
            Ok("bot-user".into())
        }

        async fn acquire_webhook(&self, channel_id: &str) -> Result<Webhook> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            // Let concurrent callers pile onto the pending future.
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Webhook {
                id: format!("hook-{channel_id}"),
                token: "tok".into(),
                channel_id: channel_id.into(),
            })
        }

        async fn execute_webhook(
            &self,
            webhook: &Webhook,
            post: WebhookPost,
        ) -> Result<SentMessage> {
            let id = format!("m-{}", self.posts.lock().unwrap().len());
            self.posts.lock().unwrap().push(post);
            Ok(SentMessage {
                id,
                channel_id: webhook.channel_id.clone(),
            })
        }

        async fn edit_webhook_message(
            &self,
            _webhook: &Webhook,
            _message_id: &str,
            _content: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn send_dm(&self, _user_id: &str, _content: &str) -> Result<()> {
            Ok(())
        }

        async fn send_channel_message(&self, _channel_id: &str, _content: &str) -> Result<()> {
            Ok(())
        }

        async fn create_role(
            &self,
            _server_id: &str,
            _name: &str,
            _color: Option<u32>,
        ) -> Result<String> {
            Ok("role-1".into())
        }

        async fn delete_role(&self, _server_id: &str, _role_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn identity() -> EntityIdentity {
        EntityIdentity {
            entity_id: "e1".into(),
            name: "Weaver".into(),
            avatar_url: Some("https://cdn.example/a.png".into()),
        }
    }

    #[tokio::test]
    async fn concurrent_sends_acquire_once() {
        let api = MockApi::new();
        let proxy = Arc::new(WebhookProxy::new(
            Arc::clone(&api) as Arc<dyn PlatformApi>,
            Arc::new(Attribution::new()),
        ));

        let mut handles = Vec::new();
        for i in 0..8 {
            let proxy = Arc::clone(&proxy);
            handles.push(tokio::spawn(async move {
                proxy
                    .send_text(&identity(), "c1", &format!("post {i}"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(api.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(api.posts.lock().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn separate_channels_acquire_separately() {
        let api = MockApi::new();
        let proxy = WebhookProxy::new(
            Arc::clone(&api) as Arc<dyn PlatformApi>,
            Arc::new(Attribution::new()),
        );

        proxy.send_text(&identity(), "c1", "a").await.unwrap();
        proxy.send_text(&identity(), "c2", "b").await.unwrap();
        proxy.send_text(&identity(), "c1", "c").await.unwrap();

        assert_eq!(api.acquires.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn posts_carry_identity_and_cache_busted_avatar() {
        let api = MockApi::new();
        let proxy = WebhookProxy::new(
            Arc::clone(&api) as Arc<dyn PlatformApi>,
            Arc::new(Attribution::new()),
        );

        proxy.send_text(&identity(), "c1", "hello").await.unwrap();
        let posts = api.posts.lock().unwrap();
        assert_eq!(posts[0].username, "Weaver");
        let avatar = posts[0].avatar_url.as_deref().unwrap();
        assert!(avatar.starts_with("https://cdn.example/a.png?v="));
        assert_eq!(posts[0].allowed_mentions, AllowedMentions::Users);
    }

    #[tokio::test]
    async fn embeds_disable_mentions() {
        let api = MockApi::new();
        let proxy = WebhookProxy::new(
            Arc::clone(&api) as Arc<dyn PlatformApi>,
            Arc::new(Attribution::new()),
        );

        proxy
            .send_embed(&identity(), "c1", serde_json::json!({ "title": "t" }))
            .await
            .unwrap();
        let posts = api.posts.lock().unwrap();
        assert_eq!(posts[0].allowed_mentions, AllowedMentions::None);
    }

    #[tokio::test]
    async fn sent_messages_are_attributed() {
        let api = MockApi::new();
        let attribution = Arc::new(Attribution::new());
        let proxy = WebhookProxy::new(
            Arc::clone(&api) as Arc<dyn PlatformApi>,
            Arc::clone(&attribution),
        );

        let sent = proxy.send_text(&identity(), "c1", "hello").await.unwrap();
        assert_eq!(proxy.attribute(&sent.id).as_deref(), Some("e1"));
        assert_eq!(attribution.entity_for(&sent.id).as_deref(), Some("e1"));
    }
}
