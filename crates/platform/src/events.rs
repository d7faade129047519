use serde::{Deserialize, Serialize};

/// One inbound platform event, normalized for the router.
///
/// `channel_name` is a display cache filled by clients that track channel
/// metadata; the raw gateway payload does not carry it, so it may be
/// empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub message_id: String,
    /// Absent for direct messages; the router drops those.
    pub server_id: Option<String>,
    pub channel_id: String,
    #[serde(default)]
    pub channel_name: String,
    pub author_id: String,
    pub author_name: String,
    #[serde(default)]
    pub author_is_bot: bool,
    /// Set when the message was posted by a webhook.
    #[serde(default)]
    pub webhook_id: Option<String>,
    pub content: String,
    /// Role ids mentioned in the message; resolves entity @-mentions.
    #[serde(default)]
    pub role_mentions: Vec<String>,
}
