//! Centralized capability gate.
//!
//! Before any tool body runs, the union of the entity's per-server
//! permission rows decides whether the tool name, `channel_id` argument,
//! and `server_id` argument are admissible. Tool bodies are only invoked
//! after they pass.

use std::collections::BTreeSet;

use {
    arachne_common::{Error, Result},
    arachne_registry::EntityServer,
    serde_json::Value,
};

use crate::catalog::{GateClass, ToolSpec};

/// Union of an entity's permission rows. `None` whitelists mean
/// unrestricted (some row grants "all"); an entity with no rows gets empty
/// sets and can do nothing.
#[derive(Debug, Clone)]
pub struct Capabilities {
    channels: Option<BTreeSet<String>>,
    servers: BTreeSet<String>,
    tools: Option<BTreeSet<String>>,
    blocked_channels: BTreeSet<String>,
}

impl Capabilities {
    #[must_use]
    pub fn from_rows(rows: &[EntityServer]) -> Self {
        let mut any_all_channels = false;
        let mut channels = BTreeSet::new();
        let mut any_all_tools = false;
        let mut tools = BTreeSet::new();
        let mut servers = BTreeSet::new();
        let mut blocked_channels = BTreeSet::new();

        for row in rows {
            servers.insert(row.server_id.clone());
            if row.channels.is_empty() {
                any_all_channels = true;
            } else {
                channels.extend(row.channels.iter().cloned());
            }
            if row.tools.is_empty() {
                any_all_tools = true;
            } else {
                tools.extend(row.tools.iter().cloned());
            }
            blocked_channels.extend(row.blocked_channels.iter().cloned());
        }

        Self {
            channels: (!any_all_channels).then_some(channels),
            servers,
            tools: (!any_all_tools).then_some(tools),
            blocked_channels,
        }
    }

    #[must_use]
    pub fn allows_tool(&self, name: &str) -> bool {
        self.tools.as_ref().is_none_or(|tools| tools.contains(name))
    }

    /// Reject the invocation unless the tool name and any channel/server
    /// arguments fall inside the entity's capability set. Send-class tools
    /// additionally fail on owner-blocked channels.
    pub fn check(&self, spec: &ToolSpec, args: &Value) -> Result<()> {
        if !self.allows_tool(spec.name) {
            return Err(Error::forbidden(format!(
                "tool {} is not in this entity's whitelist",
                spec.name
            )));
        }

        if let Some(channel_id) = args["channel_id"].as_str() {
            let allowed = self
                .channels
                .as_ref()
                .is_none_or(|channels| channels.contains(channel_id));
            if !allowed {
                return Err(Error::forbidden(format!(
                    "channel {channel_id} is outside this entity's whitelist"
                )));
            }
            if spec.gate == GateClass::Send && self.blocked_channels.contains(channel_id) {
                return Err(Error::bad_request(format!(
                    "channel {channel_id} is blocked for this entity"
                )));
            }
        }

        if let Some(server_id) = args["server_id"].as_str()
            && !self.servers.contains(server_id)
        {
            return Err(Error::forbidden(format!(
                "server {server_id} is outside this entity's servers"
            )));
        }

        Ok(())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::catalog::find_tool, serde_json::json};

    fn row(server: &str, channels: &[&str], tools: &[&str], blocked: &[&str]) -> EntityServer {
        EntityServer {
            entity_id: "e1".into(),
            server_id: server.into(),
            channels: channels.iter().map(|s| s.to_string()).collect(),
            tools: tools.iter().map(|s| s.to_string()).collect(),
            watch_channels: BTreeSet::new(),
            blocked_channels: blocked.iter().map(|s| s.to_string()).collect(),
            role_id: None,
            announce_channel_id: None,
            template_id: None,
        }
    }

    #[test]
    fn empty_row_sets_mean_all() {
        let caps = Capabilities::from_rows(&[row("s1", &[], &[], &[])]);
        let send = find_tool("send_message").unwrap();
        assert!(caps.allows_tool("anything"));
        assert!(caps.check(send, &json!({ "channel_id": "c9" })).is_ok());
    }

    #[test]
    fn no_rows_means_nothing() {
        let caps = Capabilities::from_rows(&[]);
        let send = find_tool("send_message").unwrap();
        assert!(!caps.allows_tool("send_message"));
        assert!(caps.check(send, &json!({ "channel_id": "c1" })).is_err());
    }

    #[test]
    fn channel_outside_whitelist_is_forbidden() {
        let caps = Capabilities::from_rows(&[row("s1", &["c1"], &[], &[])]);
        let send = find_tool("send_message").unwrap();
        assert!(caps.check(send, &json!({ "channel_id": "c1" })).is_ok());
        let err = caps
            .check(send, &json!({ "channel_id": "c2" }))
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[test]
    fn blocked_channel_is_hard_400_for_send_only() {
        let caps = Capabilities::from_rows(&[row("s1", &["c1", "c2"], &[], &["c2"])]);
        let send = find_tool("send_message").unwrap();
        let read = find_tool("get_channel_history").unwrap();

        // Reading a blocked channel is fine; sending is a hard 400.
        assert!(caps.check(read, &json!({ "channel_id": "c2" })).is_ok());
        let err = caps
            .check(send, &json!({ "channel_id": "c2" }))
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn tool_whitelist_is_enforced() {
        let caps = Capabilities::from_rows(&[row("s1", &[], &["read_messages"], &[])]);
        assert!(caps.allows_tool("read_messages"));
        assert!(!caps.allows_tool("send_message"));
    }

    #[test]
    fn union_absorbs_all_grants() {
        // One server grants everything, another is narrow: union is "all".
        let caps =
            Capabilities::from_rows(&[row("s1", &["c1"], &["x"], &[]), row("s2", &[], &[], &[])]);
        let send = find_tool("send_message").unwrap();
        assert!(caps.allows_tool("send_message"));
        assert!(caps.check(send, &json!({ "channel_id": "c7" })).is_ok());
    }

    #[test]
    fn server_argument_is_checked() {
        let caps = Capabilities::from_rows(&[row("s1", &[], &[], &[])]);
        let leave = find_tool("leave_server").unwrap();
        assert!(caps.check(leave, &json!({ "server_id": "s1" })).is_ok());
        let err = caps
            .check(leave, &json!({ "server_id": "s2" }))
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
    }
}
