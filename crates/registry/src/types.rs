use std::collections::BTreeSet;

use {
    arachne_common::Result,
    serde::{Deserialize, Serialize},
};

/// Which AI platform backs an entity. Stored lowercase; `display_name`
/// capitalizes for announcement templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformTag {
    Claude,
    Gpt,
    Gemini,
    Other,
}

impl PlatformTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gpt => "gpt",
            Self::Gemini => "gemini",
            Self::Other => "other",
        }
    }

    /// Parse a stored tag; unknown values collapse to `Other`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "claude" => Self::Claude,
            "gpt" => Self::Gpt,
            "gemini" => Self::Gemini,
            _ => Self::Other,
        }
    }

    /// Capitalized form for announcement templates. `Other` has no public
    /// display name; template lines naming it are removed (§ announcement
    /// grammar).
    #[must_use]
    pub fn display_name(self) -> Option<&'static str> {
        match self {
            Self::Claude => Some("Claude"),
            Self::Gpt => Some("GPT"),
            Self::Gemini => Some("Gemini"),
            Self::Other => None,
        }
    }
}

/// A named identity sharing the upstream bot connection.
#[derive(Debug, Clone, Serialize)]
pub struct EntityRecord {
    pub id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub description: Option<String>,
    pub accent_color: Option<String>,
    pub platform: PlatformTag,
    pub owner_id: String,
    pub owner_name: String,
    /// bcrypt hash of the API key; with `key_salt`, the only persisted
    /// authenticator. The raw key is returned exactly once at creation
    /// and regeneration.
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    /// 128-bit hex salt for message-encryption key derivation.
    #[serde(skip_serializing)]
    pub key_salt: String,
    pub triggers: Vec<String>,
    pub notify_on_mention: bool,
    pub notify_on_trigger: bool,
    pub active: bool,
    pub created_at: String,
}

/// Fields supplied when creating an entity.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEntity {
    pub name: String,
    pub avatar_url: Option<String>,
    pub description: Option<String>,
    pub accent_color: Option<String>,
    pub platform: PlatformTag,
    pub owner_id: String,
    pub owner_name: String,
}

/// Owner-editable profile fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateEntity {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub description: Option<String>,
    pub accent_color: Option<String>,
    pub triggers: Option<Vec<String>>,
    pub notify_on_mention: Option<bool>,
    pub notify_on_trigger: Option<bool>,
}

/// Per-(entity, server) permission row. Two tiers: the admin ceiling
/// (`channels`, `tools`) and owner tuning (`watch_channels`,
/// `blocked_channels`), always subsets of the ceiling and disjoint.
#[derive(Debug, Clone, Serialize)]
pub struct EntityServer {
    pub entity_id: String,
    pub server_id: String,
    /// Admin channel whitelist. Empty means every channel.
    pub channels: BTreeSet<String>,
    /// Admin tool whitelist. Empty means every tool.
    pub tools: BTreeSet<String>,
    pub watch_channels: BTreeSet<String>,
    pub blocked_channels: BTreeSet<String>,
    /// Platform role auto-created to make the entity mentionable.
    pub role_id: Option<String>,
    pub announce_channel_id: Option<String>,
    /// Bound template; future template edits propagate until a manual
    /// channel/tool edit detaches the binding.
    pub template_id: Option<String>,
}

impl EntityServer {
    /// Whether the admin ceiling admits this channel.
    #[must_use]
    pub fn allows_channel(&self, channel_id: &str) -> bool {
        self.channels.is_empty() || self.channels.contains(channel_id)
    }

    /// Whether the admin ceiling admits this tool.
    #[must_use]
    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tools.is_empty() || self.tools.contains(tool)
    }
}

/// Hot-path row: an active entity joined with its permission row for one
/// server.
#[derive(Debug, Clone)]
pub struct EntityRoute {
    pub entity: EntityRecord,
    pub perms: EntityServer,
}

/// Per-server operator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSettings {
    pub server_id: String,
    pub announce_channel_id: Option<String>,
    pub announce_message: Option<String>,
    pub default_template_id: Option<String>,
}

/// Reusable (channels, tools) preset. Applying copies the current values;
/// binding additionally records the template id on the row.
#[derive(Debug, Clone, Serialize)]
pub struct ServerTemplate {
    pub id: String,
    pub server_id: String,
    pub name: String,
    pub channels: BTreeSet<String>,
    pub tools: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }
}

/// A request to let an entity join a server. Terminal states are
/// write-once.
#[derive(Debug, Clone, Serialize)]
pub struct ServerRequest {
    pub id: String,
    pub entity_id: String,
    pub server_id: String,
    pub status: RequestStatus,
    pub requester_id: String,
    pub requester_name: String,
    pub reviewer_id: Option<String>,
    pub created_at: String,
    pub reviewed_at: Option<String>,
}

// ── OAuth artifacts ──────────────────────────────────────────────────────────

/// A dynamically registered OAuth client (RFC 7591). Public clients only
/// (`token_endpoint_auth_method` defaults to "none").
#[derive(Debug, Clone, Serialize)]
pub struct OAuthClientRecord {
    pub id: String,
    pub name: Option<String>,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub created_at: i64,
}

/// One-time authorization code with its PKCE binding. Consume is a
/// destructive fetch.
#[derive(Debug, Clone)]
pub struct AuthCodeRecord {
    pub code: String,
    pub client_id: String,
    pub entity_id: String,
    pub user_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub scope: String,
    pub expires_at: i64,
}

/// Revocation bookkeeping for an issued JWT; the token itself is
/// self-contained.
#[derive(Debug, Clone)]
pub struct AccessTokenRecord {
    pub jti: String,
    pub entity_id: String,
    pub user_id: String,
    pub client_id: String,
    pub scope: String,
    pub expires_at: i64,
    pub revoked: bool,
}

/// Opaque single-use refresh token paired with the access token's `jti`.
#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub token: String,
    pub jti: String,
    pub client_id: String,
    pub entity_id: String,
    pub user_id: String,
    pub scope: String,
    pub expires_at: i64,
}

// ── Set column encoding (private) ────────────────────────────────────────────

pub(crate) fn set_to_json(set: &BTreeSet<String>) -> String {
    serde_json::to_string(set).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn set_from_json(raw: &str) -> Result<BTreeSet<String>> {
    Ok(serde_json::from_str(raw)?)
}

pub(crate) fn vec_to_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn vec_from_json(raw: &str) -> Result<Vec<String>> {
    Ok(serde_json::from_str(raw)?)
}
