//! Process configuration, read from the environment.
//!
//! Every knob has an `ARACHNE_*` variable. Secrets are wrapped in
//! [`secrecy::Secret`] so they never end up in debug output.

use std::path::PathBuf;

use {
    arachne_common::{Error, Result},
    secrecy::Secret,
    tracing::warn,
};

/// Default message TTL: 15 minutes.
pub const DEFAULT_TTL_MS: u64 = 15 * 60 * 1000;
/// Hard ceiling on the message TTL: 1 hour.
pub const MAX_TTL_MS: u64 = 60 * 60 * 1000;
/// Default per-entity queue cap.
pub const DEFAULT_QUEUE_CAP: usize = 500;
/// Default eviction sweep interval, seconds.
pub const DEFAULT_SWEEP_SECS: u64 = 60;

/// Resolved process configuration.
pub struct Config {
    /// Discord bot token for the shared upstream connection.
    pub bot_token: Secret<String>,
    /// Discord OAuth application client id (identity verification in the
    /// authorization flow).
    pub discord_client_id: String,
    /// Discord OAuth application client secret.
    pub discord_client_secret: Secret<String>,
    /// HMAC secret for OAuth access tokens and dashboard session tokens.
    pub jwt_secret: Secret<String>,
    /// Public base URL of this process, no trailing slash.
    pub base_url: String,
    /// Directory holding the SQLite database and avatar files.
    pub data_dir: PathBuf,
    /// Message TTL in milliseconds, clamped to [1s, 1h].
    pub queue_ttl_ms: u64,
    /// Per-entity queue cap.
    pub queue_cap: usize,
    /// Eviction sweep interval, seconds.
    pub sweep_interval_secs: u64,
    /// Platform user ids with operator rights on the dashboard.
    pub operator_ids: Vec<String>,
    /// HTTP bind address.
    pub bind: String,
    /// HTTP port.
    pub port: u16,
}

impl Config {
    /// Read configuration from the environment. Missing required variables
    /// are a fatal startup error.
    pub fn from_env() -> Result<Self> {
        let bot_token = require("ARACHNE_BOT_TOKEN")?;
        let discord_client_id = require("ARACHNE_DISCORD_CLIENT_ID")?;
        let discord_client_secret = require("ARACHNE_DISCORD_CLIENT_SECRET")?;
        let jwt_secret = require("ARACHNE_JWT_SECRET")?;
        let base_url = optional("ARACHNE_BASE_URL")
            .unwrap_or_else(|| "http://localhost:3000".to_string());

        Ok(Self {
            bot_token: Secret::new(bot_token),
            discord_client_id,
            discord_client_secret: Secret::new(discord_client_secret),
            jwt_secret: Secret::new(jwt_secret),
            base_url: normalize_base_url(&base_url),
            data_dir: optional("ARACHNE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            queue_ttl_ms: clamp_ttl(parse_or("ARACHNE_QUEUE_TTL_MS", DEFAULT_TTL_MS)),
            queue_cap: parse_or("ARACHNE_QUEUE_CAP", DEFAULT_QUEUE_CAP),
            sweep_interval_secs: parse_or("ARACHNE_SWEEP_SECS", DEFAULT_SWEEP_SECS),
            operator_ids: parse_id_list(optional("ARACHNE_OPERATOR_IDS").as_deref()),
            bind: optional("ARACHNE_BIND").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or("ARACHNE_PORT", 3000),
        })
    }

    /// Path of the SQLite database file inside the data directory.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("arachne.db")
    }

    /// Resource identifier of an entity's MCP endpoint (used as the JWT
    /// audience and the RFC 8707 resource).
    #[must_use]
    pub fn mcp_resource(&self, entity_id: &str) -> String {
        format!("{}/mcp/{entity_id}", self.base_url)
    }

    /// Audience claim for dashboard session tokens.
    #[must_use]
    pub fn dashboard_audience(&self) -> String {
        format!("{}/dashboard", self.base_url)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bot_token", &"[REDACTED]")
            .field("discord_client_id", &self.discord_client_id)
            .field("discord_client_secret", &"[REDACTED]")
            .field("jwt_secret", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("data_dir", &self.data_dir)
            .field("queue_ttl_ms", &self.queue_ttl_ms)
            .field("queue_cap", &self.queue_cap)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("operator_ids", &self.operator_ids)
            .field("bind", &self.bind)
            .field("port", &self.port)
            .finish()
    }
}

fn require(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::bad_request(format!("missing required environment variable {name}")))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "unparseable value, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Clamp the TTL to [1s, 1h]. The upper bound keeps worst-case memory
/// overhang bounded; the lower bound keeps the queue usable at all.
#[must_use]
pub fn clamp_ttl(ttl_ms: u64) -> u64 {
    ttl_ms.clamp(1_000, MAX_TTL_MS)
}

/// Parse a comma-separated id list, ignoring blanks.
#[must_use]
pub fn parse_id_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Strip trailing slashes so path joins are predictable.
#[must_use]
pub fn normalize_base_url(raw: &str) -> String {
    raw.trim_end_matches('/').to_string()
}
