//! Stateless per-request MCP server.
//!
//! Each `POST /mcp/{entity_id}` builds a fresh view of the entity's
//! capabilities, authenticates, and dispatches one JSON-RPC message.

use std::sync::Arc;

use {
    arachne_bus::{KeyStore, MessageBus, ReadOptions},
    arachne_common::{Error, Result},
    arachne_platform::{PlatformApi, RestToolBackend},
    arachne_registry::Registry,
    arachne_webhook::{EntityIdentity, WebhookProxy},
    base64::Engine,
    secrecy::Secret,
    serde_json::{Value, json},
    tracing::warn,
};

use crate::{
    auth::{self, AuthContext},
    catalog::{CoreTool, ToolHandler, catalog, find_tool},
    gate::Capabilities,
    types::{
        INVALID_PARAMS, INVALID_REQUEST, InitializeResult, JsonRpcRequest, JsonRpcResponse,
        METHOD_NOT_FOUND, PROTOCOL_VERSION, ServerCapabilities, ServerInfo, ToolsCallParams,
        ToolsCallResult, ToolsCapability, ToolsListResult,
    },
};

pub struct McpService {
    registry: Registry,
    bus: Arc<MessageBus>,
    keys: Arc<KeyStore>,
    proxy: Arc<WebhookProxy>,
    api: Arc<dyn PlatformApi>,
    rest_tools: Arc<dyn RestToolBackend>,
    jwt_secret: Secret<String>,
    base_url: String,
}

impl McpService {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        registry: Registry,
        bus: Arc<MessageBus>,
        keys: Arc<KeyStore>,
        proxy: Arc<WebhookProxy>,
        api: Arc<dyn PlatformApi>,
        rest_tools: Arc<dyn RestToolBackend>,
        jwt_secret: Secret<String>,
        base_url: String,
    ) -> Self {
        Self {
            registry,
            bus,
            keys,
            proxy,
            api,
            rest_tools,
            jwt_secret,
            base_url,
        }
    }

    /// Handle one MCP request. `Ok(None)` means the message was a
    /// notification and gets no body. Authentication errors propagate so
    /// the HTTP layer can attach the `WWW-Authenticate` challenge.
    pub async fn handle(
        &self,
        entity_id: &str,
        bearer: Option<&str>,
        body: Value,
    ) -> Result<Option<JsonRpcResponse>> {
        let auth = auth::authenticate(
            &self.registry,
            &self.keys,
            &self.bus,
            &self.jwt_secret,
            &self.base_url,
            entity_id,
            bearer,
        )
        .await?;

        let request: JsonRpcRequest = match serde_json::from_value(body) {
            Ok(request) => request,
            Err(_) => {
                return Ok(Some(JsonRpcResponse::error(
                    Value::Null,
                    INVALID_REQUEST,
                    "invalid JSON-RPC request",
                )));
            },
        };

        let Some(id) = request.id.clone() else {
            // Notifications (initialized, cancelled, …) are acknowledged by
            // silence.
            return Ok(None);
        };

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                id,
                serde_json::to_value(InitializeResult {
                    protocol_version: PROTOCOL_VERSION.into(),
                    capabilities: ServerCapabilities {
                        tools: Some(ToolsCapability {
                            list_changed: false,
                        }),
                    },
                    server_info: ServerInfo {
                        name: "arachne".into(),
                        version: Some(env!("CARGO_PKG_VERSION").into()),
                    },
                })?,
            ),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                let caps = self.capabilities(entity_id).await?;
                let tools = catalog()
                    .iter()
                    .filter(|spec| caps.allows_tool(spec.name))
                    .map(|spec| spec.def())
                    .collect();
                JsonRpcResponse::success(id, serde_json::to_value(ToolsListResult { tools })?)
            },
            "tools/call" => {
                let params: ToolsCallParams = match request
                    .params
                    .clone()
                    .map(serde_json::from_value)
                    .transpose()
                {
                    Ok(Some(params)) => params,
                    _ => {
                        return Ok(Some(JsonRpcResponse::error(
                            id,
                            INVALID_PARAMS,
                            "tools/call requires name and arguments",
                        )));
                    },
                };
                let result = self.call_tool(&auth, &params.name, &params.arguments).await;
                JsonRpcResponse::success(id, serde_json::to_value(result)?)
            },
            other => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("unknown method {other}")),
        };
        Ok(Some(response))
    }

    async fn capabilities(&self, entity_id: &str) -> Result<Capabilities> {
        let rows = self.registry.list_entity_servers(entity_id).await?;
        Ok(Capabilities::from_rows(&rows))
    }

    /// Gate, then dispatch. Tool failures come back as structured tool
    /// errors, never protocol errors.
    async fn call_tool(&self, auth: &AuthContext, name: &str, args: &Value) -> ToolsCallResult {
        let Some(spec) = find_tool(name) else {
            return ToolsCallResult::failure(format!("unknown tool {name}"));
        };

        let caps = match self.capabilities(&auth.entity.id).await {
            Ok(caps) => caps,
            Err(e) => return ToolsCallResult::failure(e.to_string()),
        };
        if let Err(e) = caps.check(spec, args) {
            return ToolsCallResult::failure(e.to_string());
        }

        let outcome = match spec.handler {
            ToolHandler::Core(tool) => self.call_core(auth, tool, args).await,
            ToolHandler::Rest => self.rest_tools.invoke(name, args).await,
        };
        match outcome {
            Ok(value) => ToolsCallResult::text(&value),
            Err(e) => ToolsCallResult::failure(e.to_string()),
        }
    }

    async fn call_core(&self, auth: &AuthContext, tool: CoreTool, args: &Value) -> Result<Value> {
        match tool {
            CoreTool::ReadMessages => self.read_messages(auth, args),
            CoreTool::SendMessage => self.send_message(auth, args).await,
            CoreTool::SendFile => self.send_file(auth, args).await,
            CoreTool::EditMessage => self.edit_message(auth, args).await,
            CoreTool::Introduce => self.introduce(auth, args).await,
            CoreTool::LeaveServer => self.leave_server(auth, args).await,
        }
    }

    fn read_messages(&self, auth: &AuthContext, args: &Value) -> Result<Value> {
        let opts = ReadOptions {
            channel_id: args["channel_id"].as_str().map(str::to_string),
            limit: args["limit"].as_u64().unwrap_or(50).min(500) as usize,
            key: auth.encryption_key,
            triggered_only: args["triggered_only"].as_bool().unwrap_or(false),
        };
        let messages = self.bus.read(&auth.entity.id, &opts);
        Ok(json!({ "count": messages.len(), "messages": messages }))
    }

    async fn send_message(&self, auth: &AuthContext, args: &Value) -> Result<Value> {
        let channel_id = required_str(args, "channel_id")?;
        let content = required_str(args, "content")?;
        let sent = self
            .proxy
            .send_text(&self.identity(auth), channel_id, content)
            .await?;
        Ok(json!({ "message_id": sent.id, "channel_id": sent.channel_id }))
    }

    async fn send_file(&self, auth: &AuthContext, args: &Value) -> Result<Value> {
        let channel_id = required_str(args, "channel_id")?;
        let filename = required_str(args, "filename")?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(required_str(args, "data_base64")?)
            .map_err(|_| Error::bad_request("data_base64 is not valid base64"))?;
        let sent = self
            .proxy
            .send_file(
                &self.identity(auth),
                channel_id,
                filename,
                data,
                args["content"].as_str(),
            )
            .await?;
        Ok(json!({ "message_id": sent.id, "channel_id": sent.channel_id }))
    }

    async fn edit_message(&self, auth: &AuthContext, args: &Value) -> Result<Value> {
        let channel_id = required_str(args, "channel_id")?;
        let message_id = required_str(args, "message_id")?;
        let content = required_str(args, "content")?;

        // Attribution is best-effort (15-minute window), but when it knows
        // the message belongs to another entity, refuse.
        if let Some(owner) = self.proxy.attribute(message_id)
            && owner != auth.entity.id
        {
            return Err(Error::forbidden("message belongs to another entity"));
        }

        self.proxy.edit(channel_id, message_id, content).await?;
        Ok(json!({ "edited": true, "message_id": message_id }))
    }

    async fn introduce(&self, auth: &AuthContext, args: &Value) -> Result<Value> {
        let channel_id = required_str(args, "channel_id")?;
        let content = match args["message"].as_str() {
            Some(custom) => custom.to_string(),
            None => {
                let entity = &auth.entity;
                match &entity.description {
                    Some(description) => {
                        format!("Hello! I'm **{}** — {description}", entity.name)
                    },
                    None => format!("Hello! I'm **{}**.", entity.name),
                }
            },
        };
        let sent = self
            .proxy
            .send_text(&self.identity(auth), channel_id, &content)
            .await?;
        Ok(json!({ "message_id": sent.id, "channel_id": sent.channel_id }))
    }

    async fn leave_server(&self, auth: &AuthContext, args: &Value) -> Result<Value> {
        let server_id = required_str(args, "server_id")?;
        let role_id = self
            .registry
            .remove_entity_server(&auth.entity.id, server_id)
            .await?;

        // Role deletion is best-effort: the row is already gone and stays
        // gone.
        if let Some(role_id) = role_id
            && let Err(e) = self.api.delete_role(server_id, &role_id).await
        {
            warn!(
                entity_id = %auth.entity.id,
                server_id,
                role_id = %role_id,
                error = %e,
                "role cleanup failed after leaving server"
            );
        }
        Ok(json!({ "left": true, "server_id": server_id }))
    }

    fn identity(&self, auth: &AuthContext) -> EntityIdentity {
        EntityIdentity {
            entity_id: auth.entity.id.clone(),
            name: auth.entity.name.clone(),
            avatar_url: auth.entity.avatar_url.clone(),
        }
    }
}

fn required_str<'a>(args: &'a Value, name: &str) -> Result<&'a str> {
    args[name]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::bad_request(format!("missing required argument {name}")))
}
