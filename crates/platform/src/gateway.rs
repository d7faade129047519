//! Minimal Discord gateway connection.
//!
//! One long-lived task holds the websocket: identify, heartbeat on the
//! interval the gateway dictates, and forward `MESSAGE_CREATE` dispatches
//! into the router's channel. Anything that breaks the socket tears the
//! connection down and reconnects with backoff; we re-identify rather than
//! resume, which is acceptable because queues are volatile anyway.

use std::time::Duration;

use {
    futures::{SinkExt, StreamExt},
    secrecy::{ExposeSecret, Secret},
    serde_json::{Value, json},
    tokio::sync::mpsc,
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::events::GatewayEvent;

pub const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT.
const INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 15);

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Run the gateway connection until cancelled. Events flow into `events`;
/// a closed receiver ends the task.
pub async fn run_gateway(
    token: Secret<String>,
    events: mpsc::Sender<GatewayEvent>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match connect_once(&token, &events, &cancel).await {
            ConnectionEnd::Cancelled | ConnectionEnd::ReceiverClosed => return,
            ConnectionEnd::Disconnected => {
                warn!("gateway connection lost, reconnecting");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(RECONNECT_BACKOFF) => {},
                }
            },
        }
    }
}

enum ConnectionEnd {
    Cancelled,
    ReceiverClosed,
    Disconnected,
}

async fn connect_once(
    token: &Secret<String>,
    events: &mpsc::Sender<GatewayEvent>,
    cancel: &CancellationToken,
) -> ConnectionEnd {
    let (mut ws, _) = match connect_async(GATEWAY_URL).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "gateway connect failed");
            return ConnectionEnd::Disconnected;
        },
    };

    // First frame must be Hello with the heartbeat interval.
    let heartbeat_ms = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame: Value = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                if frame["op"].as_u64() == Some(10) {
                    break frame["d"]["heartbeat_interval"].as_u64().unwrap_or(41_250);
                }
            },
            Some(Ok(_)) => continue,
            _ => return ConnectionEnd::Disconnected,
        }
    };

    let identify = json!({
        "op": 2,
        "d": {
            "token": token.expose_secret(),
            "intents": INTENTS,
            "properties": { "os": "linux", "browser": "arachne", "device": "arachne" },
        },
    });
    if ws.send(Message::text(identify.to_string())).await.is_err() {
        return ConnectionEnd::Disconnected;
    }
    info!(heartbeat_ms, "gateway identified");

    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_ms));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seq: Option<u64> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = ws.send(Message::Close(None)).await;
                return ConnectionEnd::Cancelled;
            },
            _ = heartbeat.tick() => {
                let beat = json!({ "op": 1, "d": last_seq });
                if ws.send(Message::text(beat.to_string())).await.is_err() {
                    return ConnectionEnd::Disconnected;
                }
            },
            frame = ws.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        return ConnectionEnd::Disconnected;
                    },
                    Some(Ok(_)) => continue,
                };
                let frame: Value = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "unparseable gateway frame");
                        continue;
                    },
                };
                if let Some(seq) = frame["s"].as_u64() {
                    last_seq = Some(seq);
                }
                match frame["op"].as_u64() {
                    // Dispatch
                    Some(0) => {
                        if frame["t"].as_str() == Some("MESSAGE_CREATE")
                            && let Some(event) = parse_message_create(&frame["d"])
                            && events.send(event).await.is_err()
                        {
                            return ConnectionEnd::ReceiverClosed;
                        }
                    },
                    // Reconnect / invalid session: drop and re-identify.
                    Some(7) | Some(9) => return ConnectionEnd::Disconnected,
                    // Heartbeat request
                    Some(1) => {
                        let beat = json!({ "op": 1, "d": last_seq });
                        if ws.send(Message::text(beat.to_string())).await.is_err() {
                            return ConnectionEnd::Disconnected;
                        }
                    },
                    _ => {},
                }
            },
        }
    }
}

fn parse_message_create(d: &Value) -> Option<GatewayEvent> {
    Some(GatewayEvent {
        message_id: d["id"].as_str()?.to_string(),
        server_id: d["guild_id"].as_str().map(String::from),
        channel_id: d["channel_id"].as_str()?.to_string(),
        channel_name: String::new(),
        author_id: d["author"]["id"].as_str().unwrap_or_default().to_string(),
        author_name: d["author"]["global_name"]
            .as_str()
            .or_else(|| d["author"]["username"].as_str())
            .unwrap_or_default()
            .to_string(),
        author_is_bot: d["author"]["bot"].as_bool().unwrap_or(false),
        webhook_id: d["webhook_id"].as_str().map(String::from),
        content: d["content"].as_str().unwrap_or_default().to_string(),
        role_mentions: d["mention_roles"]
            .as_array()
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
    })
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_create_parses_guild_message() {
        let d = json!({
            "id": "m1",
            "guild_id": "s1",
            "channel_id": "c1",
            "content": "hi @everyone",
            "mention_roles": ["r1", "r2"],
            "author": { "id": "u1", "username": "ada", "global_name": "Ada" },
        });
        let event = parse_message_create(&d).unwrap();
        assert_eq!(event.message_id, "m1");
        assert_eq!(event.server_id.as_deref(), Some("s1"));
        assert_eq!(event.author_name, "Ada");
        assert!(!event.author_is_bot);
        assert_eq!(event.role_mentions, vec!["r1", "r2"]);
    }

    #[test]
    fn message_create_flags_webhooks_and_dms() {
        let d = json!({
            "id": "m2",
            "channel_id": "c-dm",
            "content": "psst",
            "webhook_id": "w1",
            "author": { "id": "u1", "username": "ada", "bot": true },
        });
        let event = parse_message_create(&d).unwrap();
        assert!(event.server_id.is_none());
        assert_eq!(event.webhook_id.as_deref(), Some("w1"));
        assert!(event.author_is_bot);
        assert_eq!(event.author_name, "ada");
    }

    #[test]
    fn message_create_requires_ids() {
        assert!(parse_message_create(&json!({ "content": "no ids" })).is_none());
    }
}
