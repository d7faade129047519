//! The opaque state bundle threaded through the platform identity check.
//!
//! Everything the authorize endpoint validated is serialized into a
//! base64url blob, carried as the platform OAuth `state`, and decoded
//! again at the callback and consent steps.

use {
    arachne_common::{Error, Result},
    base64::Engine,
    serde::{Deserialize, Serialize},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeBundle {
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub scope: String,
    /// The client's own `state`, echoed on the final redirect.
    pub client_state: Option<String>,
    /// Entity hint extracted from an RFC 8707 `resource` parameter.
    pub entity_hint: Option<String>,
}

impl AuthorizeBundle {
    #[must_use]
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| Error::bad_request("malformed state parameter"))?;
        serde_json::from_slice(&bytes).map_err(|_| Error::bad_request("malformed state parameter"))
    }
}

/// Entity hint from an RFC 8707 resource indicator of the form
/// `…/mcp/<entity_id>`.
#[must_use]
pub fn entity_hint_from_resource(resource: &str) -> Option<String> {
    let (_, entity) = resource.rsplit_once("/mcp/")?;
    (!entity.is_empty() && !entity.contains('/')).then(|| entity.to_string())
}
