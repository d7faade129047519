//! Fan-out router: turns each inbound platform event into per-entity queue
//! entries, with permission checks, tag computation, and owner
//! notifications.

use std::sync::Arc;

use {
    arachne_bus::{InboundMessage, KeyStore, MessageBus},
    arachne_common::Result,
    arachne_platform::{GatewayEvent, PlatformApi},
    arachne_registry::Registry,
    arachne_webhook::Attribution,
    tracing::{debug, warn},
};

const EXCERPT_CHARS: usize = 120;

pub struct Router {
    registry: Registry,
    bus: Arc<MessageBus>,
    keys: Arc<KeyStore>,
    api: Arc<dyn PlatformApi>,
    attribution: Arc<Attribution>,
    bot_user_id: String,
}

impl Router {
    #[must_use]
    pub fn new(
        registry: Registry,
        bus: Arc<MessageBus>,
        keys: Arc<KeyStore>,
        api: Arc<dyn PlatformApi>,
        attribution: Arc<Attribution>,
        bot_user_id: String,
    ) -> Self {
        Self {
            registry,
            bus,
            keys,
            api,
            attribution,
            bot_user_id,
        }
    }

    /// Process one inbound event. Awaited sequentially by the gateway event
    /// loop, which is what gives each entity's queue gateway delivery
    /// order. Owner notifications are dispatched to background tasks so a
    /// slow DM never stalls fan-out.
    pub async fn handle_event(&self, event: GatewayEvent) -> Result<()> {
        // Direct messages have no server: routing them to the right entity
        // is deliberately unsolved, so they are dropped here.
        let Some(server_id) = event.server_id.clone() else {
            debug!(message_id = %event.message_id, "dropping direct message event");
            return Ok(());
        };
        if event.author_id == self.bot_user_id {
            return Ok(());
        }
        // Posts from webhooks this process owns come back around the
        // gateway; attribution already knows whose they are.
        if event.webhook_id.is_some() && self.attribution.entity_for(&event.message_id).is_some() {
            return Ok(());
        }

        let candidates = self
            .registry
            .entities_for_channel(&server_id, &event.channel_id)
            .await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let role_map = self.registry.role_entity_map(&server_id).await?;
        let mentioned_entities: Vec<&String> = event
            .role_mentions
            .iter()
            .filter_map(|role| role_map.get(role))
            .collect();
        let content_folded = event.content.to_lowercase();

        for route in candidates {
            // The hot-path query already enforced the whitelist; recheck in
            // case the row changed between query and fan-out.
            if !route.perms.allows_channel(&event.channel_id) {
                continue;
            }

            let entity = &route.entity;
            let addressed = mentioned_entities.iter().any(|id| **id == entity.id);
            let triggered = entity
                .triggers
                .iter()
                .filter(|t| !t.is_empty())
                .any(|t| content_folded.contains(&t.to_lowercase()));
            let watch = route.perms.watch_channels.contains(&event.channel_id);

            let key = self.keys.get(&entity.id);
            self.bus.enqueue(
                &entity.id,
                InboundMessage {
                    message_id: event.message_id.clone(),
                    channel_id: event.channel_id.clone(),
                    channel_name: event.channel_name.clone(),
                    server_id: server_id.clone(),
                    author_id: event.author_id.clone(),
                    author_name: event.author_name.clone(),
                    content: event.content.clone(),
                    addressed,
                    triggered,
                    watch,
                },
                key.as_ref(),
            );

            let notify = (addressed && entity.notify_on_mention)
                || (triggered && entity.notify_on_trigger);
            if notify {
                self.spawn_owner_notification(entity.owner_id.clone(), &event, &server_id);
            }
        }

        Ok(())
    }

    fn spawn_owner_notification(&self, owner_id: String, event: &GatewayEvent, server_id: &str) {
        let api = Arc::clone(&self.api);
        let content = notification_text(event, server_id);
        tokio::spawn(async move {
            if let Err(e) = api.send_dm(&owner_id, &content).await {
                warn!(owner_id = %owner_id, error = %e, "owner notification failed");
            }
        });
    }
}

fn notification_text(event: &GatewayEvent, server_id: &str) -> String {
    let excerpt: String = event.content.chars().take(EXCERPT_CHARS).collect();
    let channel = if event.channel_name.is_empty() {
        format!("<#{}>", event.channel_id)
    } else {
        format!("#{}", event.channel_name)
    };
    format!(
        "**{}** in {channel}: {excerpt}\nhttps://discord.com/channels/{server_id}/{}/{}",
        event.author_name, event.channel_id, event.message_id,
    )
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::Mutex,
        time::Duration,
    };

    use {
        arachne_bus::{BusConfig, ReadOptions},
        arachne_platform::{SentMessage, Webhook, WebhookPost},
        arachne_registry::{NewEntity, PlatformTag, UpdateEntity},
        async_trait::async_trait,
    };

    use super::*;

    struct MockApi {
        dms: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PlatformApi for MockApi {
        async fn current_user_id(&self) -> Result<String> {
            Ok("bot-user".into())
        }

        async fn acquire_webhook(&self, channel_id: &str) -> Result<Webhook> {
            Ok(Webhook {
                id: "w".into(),
                token: "t".into(),
                channel_id: channel_id.into(),
            })
        }

        async fn execute_webhook(
            &self,
            webhook: &Webhook,
            _post: WebhookPost,
        ) -> Result<SentMessage> {
            Ok(SentMessage {
                id: "m".into(),
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

        async fn send_dm(&self, user_id: &str, content: &str) -> Result<()> {
            self.dms
                .lock()
                .unwrap()
                .push((user_id.to_string(), content.to_string()));
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
            Ok("r".into())
        }

        async fn delete_role(&self, _server_id: &str, _role_id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        registry: Registry,
        bus: Arc<MessageBus>,
        keys: Arc<KeyStore>,
        api: Arc<MockApi>,
        attribution: Arc<Attribution>,
        router: Router,
    }

    async fn fixture() -> Fixture {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let registry = Registry::with_pool(pool).await.unwrap();
        let bus = Arc::new(MessageBus::new(BusConfig::default()));
        let keys = Arc::new(KeyStore::new());
        let api = Arc::new(MockApi {
            dms: Mutex::new(Vec::new()),
        });
        let attribution = Arc::new(Attribution::new());
        let router = Router::new(
            registry.clone(),
            Arc::clone(&bus),
            Arc::clone(&keys),
            Arc::clone(&api) as Arc<dyn PlatformApi>,
            Arc::clone(&attribution),
            "bot-user".into(),
        );
        Fixture {
            registry,
            bus,
            keys,
            api,
            attribution,
            router,
        }
    }

    async fn seed_entity(registry: &Registry, name: &str) -> String {
        let (entity, _) = registry
            .create_entity(NewEntity {
                name: name.into(),
                avatar_url: None,
                description: None,
                accent_color: None,
                platform: PlatformTag::Claude,
                owner_id: "owner-1".into(),
                owner_name: "Owner".into(),
            })
            .await
            .unwrap();
        entity.id
    }

    fn event(message_id: &str, channel: &str, content: &str) -> GatewayEvent {
        GatewayEvent {
            message_id: message_id.into(),
            server_id: Some("s1".into()),
            channel_id: channel.into(),
            channel_name: format!("chat-{channel}"),
            author_id: "u-author".into(),
            author_name: "Author".into(),
            author_is_bot: false,
            webhook_id: None,
            content: content.into(),
            role_mentions: Vec::new(),
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn fan_out_respects_whitelists_and_watch() {
        let f = fixture().await;
        let a = seed_entity(&f.registry, "A").await;
        let b = seed_entity(&f.registry, "B").await;
        f.registry.add_entity_server(&a, "s1").await.unwrap();
        f.registry.add_entity_server(&b, "s1").await.unwrap();
        f.registry
            .set_admin_permissions(&b, "s1", set(&["c1"]), BTreeSet::new())
            .await
            .unwrap();
        f.registry
            .set_owner_channels(&b, "s1", set(&["c1"]), BTreeSet::new())
            .await
            .unwrap();

        f.router
            .handle_event(event("m1", "c1", "hi @everyone"))
            .await
            .unwrap();

        let a_msgs = f.bus.read(&a, &ReadOptions::default());
        let b_msgs = f.bus.read(&b, &ReadOptions::default());
        assert_eq!(a_msgs.len(), 1);
        assert_eq!(b_msgs.len(), 1);
        assert!(!a_msgs[0].watch);
        assert!(b_msgs[0].watch);

        // Second event on c2: only A (empty whitelist = all channels).
        f.router
            .handle_event(event("m2", "c2", "second"))
            .await
            .unwrap();
        assert_eq!(f.bus.read(&a, &ReadOptions::default()).len(), 2);
        assert_eq!(f.bus.read(&b, &ReadOptions::default()).len(), 1);
    }

    #[tokio::test]
    async fn discards_self_dm_and_own_webhook_events() {
        let f = fixture().await;
        let a = seed_entity(&f.registry, "A").await;
        f.registry.add_entity_server(&a, "s1").await.unwrap();

        // Bot's own message.
        let mut ev = event("m1", "c1", "from the bot");
        ev.author_id = "bot-user".into();
        f.router.handle_event(ev).await.unwrap();

        // Direct message (no server id).
        let mut ev = event("m2", "c1", "a dm");
        ev.server_id = None;
        f.router.handle_event(ev).await.unwrap();

        // A webhook post this process made.
        f.attribution.record("m3", &a);
        let mut ev = event("m3", "c1", "echoed back");
        ev.webhook_id = Some("w1".into());
        f.router.handle_event(ev).await.unwrap();

        assert!(f.bus.read(&a, &ReadOptions::default()).is_empty());
    }

    #[tokio::test]
    async fn foreign_webhook_events_still_route() {
        let f = fixture().await;
        let a = seed_entity(&f.registry, "A").await;
        f.registry.add_entity_server(&a, "s1").await.unwrap();

        let mut ev = event("m1", "c1", "from some other bridge");
        ev.webhook_id = Some("not-ours".into());
        f.router.handle_event(ev).await.unwrap();

        assert_eq!(f.bus.read(&a, &ReadOptions::default()).len(), 1);
    }

    #[tokio::test]
    async fn trigger_matching_is_case_folded() {
        let f = fixture().await;
        let a = seed_entity(&f.registry, "A").await;
        f.registry.add_entity_server(&a, "s1").await.unwrap();
        f.registry
            .update_entity(&a, UpdateEntity {
                triggers: Some(vec!["Weaver".into()]),
                ..UpdateEntity::default()
            })
            .await
            .unwrap();

        f.router
            .handle_event(event("m1", "c1", "paging WEAVER please"))
            .await
            .unwrap();
        f.router
            .handle_event(event("m2", "c1", "nothing relevant"))
            .await
            .unwrap();

        let triggered = f.bus.read(&a, &ReadOptions {
            triggered_only: true,
            ..ReadOptions::default()
        });
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].message_id, "m1");
    }

    #[tokio::test]
    async fn addressed_flag_follows_role_mentions() {
        let f = fixture().await;
        let a = seed_entity(&f.registry, "A").await;
        f.registry.add_entity_server(&a, "s1").await.unwrap();
        f.registry
            .set_entity_server_role(&a, "s1", Some("role-a"))
            .await
            .unwrap();

        let mut ev = event("m1", "c1", "hey <@&role-a>");
        ev.role_mentions = vec!["role-a".into()];
        f.router.handle_event(ev).await.unwrap();

        let msgs = f.bus.read(&a, &ReadOptions::default());
        assert!(msgs[0].addressed);
    }

    #[tokio::test]
    async fn owner_notification_requires_opt_in() {
        let f = fixture().await;
        let a = seed_entity(&f.registry, "A").await;
        f.registry.add_entity_server(&a, "s1").await.unwrap();
        f.registry
            .update_entity(&a, UpdateEntity {
                triggers: Some(vec!["weaver".into()]),
                notify_on_trigger: Some(true),
                ..UpdateEntity::default()
            })
            .await
            .unwrap();

        f.router
            .handle_event(event("m1", "c1", "weaver, report"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dms = f.api.dms.lock().unwrap();
        assert_eq!(dms.len(), 1);
        assert_eq!(dms[0].0, "owner-1");
        assert!(dms[0].1.contains("weaver, report"));
        assert!(dms[0].1.contains("https://discord.com/channels/s1/c1/m1"));
    }

    #[tokio::test]
    async fn enqueue_uses_cached_key_when_present() {
        let f = fixture().await;
        let a = seed_entity(&f.registry, "A").await;
        f.registry.add_entity_server(&a, "s1").await.unwrap();
        let key = f.keys.insert(&a, "ak_raw", "deadbeef");

        f.router
            .handle_event(event("m1", "c1", "sealed at rest"))
            .await
            .unwrap();

        // Keyless read sees the sentinel; keyed read sees plaintext.
        let opaque = f.bus.read(&a, &ReadOptions::default());
        assert_eq!(opaque[0].content, arachne_bus::ENCRYPTED_SENTINEL);
        let clear = f.bus.read(&a, &ReadOptions {
            key: Some(key),
            ..ReadOptions::default()
        });
        assert_eq!(clear[0].content, "sealed at rest");
    }
}
