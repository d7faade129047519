//! Application context: every component the HTTP surface and background
//! tasks need, wired explicitly — no globals.

use std::{sync::Arc, time::Instant};

use {
    arachne_bus::{BusConfig, KeyStore, MessageBus},
    arachne_config::Config,
    arachne_mcp::McpService,
    arachne_platform::{PlatformApi, RestToolBackend},
    arachne_registry::Registry,
    arachne_router::Router as EventRouter,
    arachne_webhook::{Attribution, WebhookProxy},
    secrecy::{ExposeSecret, Secret},
};

pub struct AppContext {
    pub config: Arc<Config>,
    pub registry: Registry,
    pub bus: Arc<MessageBus>,
    pub keys: Arc<KeyStore>,
    pub attribution: Arc<Attribution>,
    pub proxy: Arc<WebhookProxy>,
    pub platform: Arc<dyn PlatformApi>,
    pub mcp: Arc<McpService>,
    pub router: Arc<EventRouter>,
    pub started_at: Instant,
}

impl AppContext {
    /// Wire the components around an already-opened registry and platform
    /// client. Tests inject mock platform implementations here; production
    /// passes the Discord REST client for both roles.
    pub fn assemble(
        config: Arc<Config>,
        registry: Registry,
        platform: Arc<dyn PlatformApi>,
        rest_tools: Arc<dyn RestToolBackend>,
        bot_user_id: String,
    ) -> Arc<Self> {
        let bus = Arc::new(MessageBus::new(BusConfig {
            ttl_ms: config.queue_ttl_ms,
            cap: config.queue_cap,
        }));
        let keys = Arc::new(KeyStore::new());
        let attribution = Arc::new(Attribution::new());
        let proxy = Arc::new(WebhookProxy::new(
            Arc::clone(&platform),
            Arc::clone(&attribution),
        ));

        let jwt_secret = Secret::new(config.jwt_secret.expose_secret().clone());
        let mcp = Arc::new(McpService::new(
            registry.clone(),
            Arc::clone(&bus),
            Arc::clone(&keys),
            Arc::clone(&proxy),
            Arc::clone(&platform),
            rest_tools,
            jwt_secret,
            config.base_url.clone(),
        ));
        let router = Arc::new(EventRouter::new(
            registry.clone(),
            Arc::clone(&bus),
            Arc::clone(&keys),
            Arc::clone(&platform),
            Arc::clone(&attribution),
            bot_user_id,
        ));

        Arc::new(Self {
            config,
            registry,
            bus,
            keys,
            attribution,
            proxy,
            platform,
            mcp,
            router,
            started_at: Instant::now(),
        })
    }
}
