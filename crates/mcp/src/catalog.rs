//! The published tool catalog.
//!
//! Each tool is a table entry: name, parameter schema, gate class, and a
//! handler tag. Core tools are implemented by this crate (queue reads and
//! identity-overridden posts); the rest are thin REST wrappers dispatched
//! through [`arachne_platform::RestToolBackend`].

use std::sync::LazyLock;

use serde_json::{Value, json};

use crate::types::ToolDef;

/// Whether a tool writes into a channel. Send-class tools are refused with
/// a hard 400 on owner-blocked channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateClass {
    Read,
    Send,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreTool {
    ReadMessages,
    SendMessage,
    SendFile,
    EditMessage,
    Introduce,
    LeaveServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolHandler {
    Core(CoreTool),
    Rest,
}

pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub gate: GateClass,
    pub handler: ToolHandler,
}

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({ "type": "object", "properties": properties, "required": required })
}

fn tool(
    name: &'static str,
    description: &'static str,
    input_schema: Value,
    gate: GateClass,
    handler: ToolHandler,
) -> ToolSpec {
    ToolSpec {
        name,
        description,
        input_schema,
        gate,
        handler,
    }
}

static CATALOG: LazyLock<Vec<ToolSpec>> = LazyLock::new(|| {
    use {CoreTool::*, GateClass::*, ToolHandler::*};

    vec![
        // ── Reading ──────────────────────────────────────────────────────
        tool(
            "read_messages",
            "Read buffered messages routed to this entity, newest last.",
            schema(
                json!({
                    "channel_id": { "type": "string", "description": "Only messages from this channel" },
                    "limit": { "type": "integer", "default": 50 },
                    "triggered_only": { "type": "boolean", "default": false, "description": "Only messages that matched a trigger word" },
                }),
                &[],
            ),
            Read,
            Core(ReadMessages),
        ),
        tool(
            "get_channel_history",
            "Fetch recent messages from a channel via the platform.",
            schema(
                json!({
                    "channel_id": { "type": "string" },
                    "limit": { "type": "integer", "default": 50 },
                }),
                &["channel_id"],
            ),
            Read,
            Rest,
        ),
        tool(
            "get_message",
            "Fetch one message by id.",
            schema(
                json!({ "channel_id": { "type": "string" }, "message_id": { "type": "string" } }),
                &["channel_id", "message_id"],
            ),
            Read,
            Rest,
        ),
        tool(
            "get_pinned_messages",
            "List a channel's pinned messages.",
            schema(json!({ "channel_id": { "type": "string" } }), &["channel_id"]),
            Read,
            Rest,
        ),
        // ── Messaging ────────────────────────────────────────────────────
        tool(
            "send_message",
            "Post a message to a channel under this entity's name and avatar. \
             Webhook posts cannot reply-thread to another message.",
            schema(
                json!({ "channel_id": { "type": "string" }, "content": { "type": "string" } }),
                &["channel_id", "content"],
            ),
            Send,
            Core(SendMessage),
        ),
        tool(
            "send_file",
            "Upload a file to a channel under this entity's identity.",
            schema(
                json!({
                    "channel_id": { "type": "string" },
                    "filename": { "type": "string" },
                    "data_base64": { "type": "string", "description": "File bytes, base64-encoded" },
                    "content": { "type": "string", "description": "Optional caption" },
                }),
                &["channel_id", "filename", "data_base64"],
            ),
            Send,
            Core(SendFile),
        ),
        tool(
            "edit_message",
            "Edit a message this entity previously sent.",
            schema(
                json!({
                    "channel_id": { "type": "string" },
                    "message_id": { "type": "string" },
                    "content": { "type": "string" },
                }),
                &["channel_id", "message_id", "content"],
            ),
            Send,
            Core(EditMessage),
        ),
        tool(
            "delete_message",
            "Delete a message.",
            schema(
                json!({ "channel_id": { "type": "string" }, "message_id": { "type": "string" } }),
                &["channel_id", "message_id"],
            ),
            Send,
            Rest,
        ),
        tool(
            "pin_message",
            "Pin a message in a channel.",
            schema(
                json!({ "channel_id": { "type": "string" }, "message_id": { "type": "string" } }),
                &["channel_id", "message_id"],
            ),
            Send,
            Rest,
        ),
        tool(
            "unpin_message",
            "Unpin a message.",
            schema(
                json!({ "channel_id": { "type": "string" }, "message_id": { "type": "string" } }),
                &["channel_id", "message_id"],
            ),
            Send,
            Rest,
        ),
        tool(
            "introduce",
            "Post this entity's introduction to a channel.",
            schema(
                json!({
                    "channel_id": { "type": "string" },
                    "message": { "type": "string", "description": "Custom introduction text" },
                }),
                &["channel_id"],
            ),
            Send,
            Core(Introduce),
        ),
        // ── Reactions ────────────────────────────────────────────────────
        tool(
            "add_reaction",
            "React to a message.",
            schema(
                json!({
                    "channel_id": { "type": "string" },
                    "message_id": { "type": "string" },
                    "emoji": { "type": "string" },
                }),
                &["channel_id", "message_id", "emoji"],
            ),
            Send,
            Rest,
        ),
        tool(
            "remove_reaction",
            "Remove this bot's reaction from a message.",
            schema(
                json!({
                    "channel_id": { "type": "string" },
                    "message_id": { "type": "string" },
                    "emoji": { "type": "string" },
                }),
                &["channel_id", "message_id", "emoji"],
            ),
            Send,
            Rest,
        ),
        tool(
            "get_reactions",
            "List users who reacted with an emoji.",
            schema(
                json!({
                    "channel_id": { "type": "string" },
                    "message_id": { "type": "string" },
                    "emoji": { "type": "string" },
                }),
                &["channel_id", "message_id", "emoji"],
            ),
            Read,
            Rest,
        ),
        // ── Threads / forums ─────────────────────────────────────────────
        tool(
            "create_thread",
            "Start a thread from a message.",
            schema(
                json!({
                    "channel_id": { "type": "string" },
                    "message_id": { "type": "string" },
                    "name": { "type": "string" },
                }),
                &["channel_id", "message_id", "name"],
            ),
            Send,
            Rest,
        ),
        tool(
            "list_threads",
            "List a server's active threads.",
            schema(json!({ "server_id": { "type": "string" } }), &["server_id"]),
            Read,
            Rest,
        ),
        tool(
            "create_forum_post",
            "Open a new forum post with an initial message.",
            schema(
                json!({
                    "channel_id": { "type": "string" },
                    "name": { "type": "string" },
                    "content": { "type": "string" },
                }),
                &["channel_id", "name", "content"],
            ),
            Send,
            Rest,
        ),
        // ── Channel management ───────────────────────────────────────────
        tool(
            "list_channels",
            "List a server's channels.",
            schema(json!({ "server_id": { "type": "string" } }), &["server_id"]),
            Read,
            Rest,
        ),
        tool(
            "get_channel_info",
            "Fetch a channel's metadata.",
            schema(json!({ "channel_id": { "type": "string" } }), &["channel_id"]),
            Read,
            Rest,
        ),
        tool(
            "create_channel",
            "Create a text channel.",
            schema(
                json!({ "server_id": { "type": "string" }, "name": { "type": "string" } }),
                &["server_id", "name"],
            ),
            Send,
            Rest,
        ),
        tool(
            "edit_channel",
            "Rename a channel or set its topic.",
            schema(
                json!({
                    "channel_id": { "type": "string" },
                    "name": { "type": "string" },
                    "topic": { "type": "string" },
                }),
                &["channel_id"],
            ),
            Send,
            Rest,
        ),
        tool(
            "delete_channel",
            "Delete a channel.",
            schema(json!({ "channel_id": { "type": "string" } }), &["channel_id"]),
            Send,
            Rest,
        ),
        // ── Server / identity ────────────────────────────────────────────
        tool(
            "list_servers",
            "List servers the bot is connected to.",
            schema(json!({}), &[]),
            Read,
            Rest,
        ),
        tool(
            "get_server_info",
            "Fetch a server's metadata.",
            schema(json!({ "server_id": { "type": "string" } }), &["server_id"]),
            Read,
            Rest,
        ),
        tool(
            "leave_server",
            "Remove this entity from a server and delete its mention role.",
            schema(json!({ "server_id": { "type": "string" } }), &["server_id"]),
            Read,
            Core(LeaveServer),
        ),
        // ── Members / roles ──────────────────────────────────────────────
        tool(
            "list_members",
            "List a server's members.",
            schema(
                json!({ "server_id": { "type": "string" }, "limit": { "type": "integer", "default": 100 } }),
                &["server_id"],
            ),
            Read,
            Rest,
        ),
        tool(
            "get_member",
            "Fetch one member's profile and roles.",
            schema(
                json!({ "server_id": { "type": "string" }, "user_id": { "type": "string" } }),
                &["server_id", "user_id"],
            ),
            Read,
            Rest,
        ),
        tool(
            "list_roles",
            "List a server's roles.",
            schema(json!({ "server_id": { "type": "string" } }), &["server_id"]),
            Read,
            Rest,
        ),
        tool(
            "add_role_to_member",
            "Grant a role to a member.",
            schema(
                json!({
                    "server_id": { "type": "string" },
                    "user_id": { "type": "string" },
                    "role_id": { "type": "string" },
                }),
                &["server_id", "user_id", "role_id"],
            ),
            Send,
            Rest,
        ),
        tool(
            "remove_role_from_member",
            "Remove a role from a member.",
            schema(
                json!({
                    "server_id": { "type": "string" },
                    "user_id": { "type": "string" },
                    "role_id": { "type": "string" },
                }),
                &["server_id", "user_id", "role_id"],
            ),
            Send,
            Rest,
        ),
        // ── Utilities ────────────────────────────────────────────────────
        tool(
            "get_user_info",
            "Fetch a user's public profile.",
            schema(json!({ "user_id": { "type": "string" } }), &["user_id"]),
            Read,
            Rest,
        ),
    ]
});

#[must_use]
pub fn catalog() -> &'static [ToolSpec] {
    &CATALOG
}

#[must_use]
pub fn find_tool(name: &str) -> Option<&'static ToolSpec> {
    CATALOG.iter().find(|t| t.name == name)
}

impl ToolSpec {
    #[must_use]
    pub fn def(&self) -> ToolDef {
        ToolDef {
            name: self.name.to_string(),
            description: Some(self.description.to_string()),
            input_schema: self.input_schema.clone(),
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashSet};

    #[test]
    fn catalog_names_are_unique() {
        let names: HashSet<&str> = catalog().iter().map(|t| t.name).collect();
        assert_eq!(names.len(), catalog().len());
    }

    #[test]
    fn catalog_covers_the_expected_surface() {
        assert_eq!(catalog().len(), 31);
        for name in [
            "read_messages",
            "send_message",
            "send_file",
            "edit_message",
            "introduce",
            "leave_server",
        ] {
            let spec = find_tool(name).unwrap();
            assert!(matches!(spec.handler, ToolHandler::Core(_)), "{name} must be core");
        }
    }

    #[test]
    fn schemas_declare_required_params() {
        let send = find_tool("send_message").unwrap();
        let required: Vec<&str> = send.input_schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(required, vec!["channel_id", "content"]);
        assert_eq!(send.input_schema["type"], "object");
    }

    #[test]
    fn posting_tools_are_send_class() {
        for name in ["send_message", "send_file", "edit_message", "introduce", "create_forum_post"] {
            assert_eq!(find_tool(name).unwrap().gate, GateClass::Send, "{name}");
        }
        assert_eq!(find_tool("read_messages").unwrap().gate, GateClass::Read);
    }
}
