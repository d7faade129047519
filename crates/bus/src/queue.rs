//! Bounded per-entity FIFO queues with TTL eviction and transparent
//! at-rest encryption.

use std::{
    collections::{HashMap, VecDeque},
    sync::RwLock,
};

use {
    arachne_common::time::now_ms,
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::crypto::{decrypt_content, encrypt_content};

/// Substituted when an encrypted message is read without a key.
pub const ENCRYPTED_SENTINEL: &str = "[encrypted]";
/// Substituted when decryption fails authentication (wrong key).
pub const KEY_MISMATCH_SENTINEL: &str = "[encrypted — key mismatch]";

/// Queue tuning. TTL is clamped by the config layer to [1s, 1h].
#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    pub ttl_ms: u64,
    pub cap: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 15 * 60 * 1000,
            cap: 500,
        }
    }
}

/// A message sitting in an entity's queue. Created by the router, mutated
/// only by retroactive encryption, destroyed by the TTL sweep.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessage {
    pub message_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub server_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub encrypted: bool,
    /// The entity's platform role was mentioned.
    pub addressed: bool,
    /// A trigger word matched the content.
    pub triggered: bool,
    /// The channel is in the entity's watch set.
    pub watch: bool,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

/// Router-supplied fields; the bus adds timestamps and encryption.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub server_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub addressed: bool,
    pub triggered: bool,
    pub watch: bool,
}

/// Read filters. Filtering order is TTL, channel, trigger; then the
/// tail-most `limit` entries in arrival order.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub channel_id: Option<String>,
    pub limit: usize,
    pub key: Option<[u8; 32]>,
    pub triggered_only: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            channel_id: None,
            limit: 50,
            key: None,
            triggered_only: false,
        }
    }
}

/// Health-endpoint view of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub entity_id: String,
    pub queued: usize,
    pub oldest_age_ms: u64,
}

/// Mapping entity id → bounded FIFO. Enqueue never blocks and never
/// back-pressures: the gateway cannot be paused, so overflow drops the
/// oldest messages with a warning.
pub struct MessageBus {
    queues: RwLock<HashMap<String, VecDeque<QueuedMessage>>>,
    ttl_ms: u64,
    cap: usize,
}

impl MessageBus {
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            ttl_ms: config.ttl_ms,
            cap: config.cap.max(1),
        }
    }

    /// Append a message. With a key the content is stored as AES-256-GCM
    /// ciphertext; without one it stays plaintext until a later reader
    /// retroactively encrypts it.
    pub fn enqueue(&self, entity_id: &str, msg: InboundMessage, key: Option<&[u8; 32]>) {
        let now = now_ms();
        let (content, encrypted) = match key {
            Some(key) => match encrypt_content(key, &msg.content) {
                Some(ciphertext) => (ciphertext, true),
                None => {
                    warn!(entity_id, "message encryption failed, storing plaintext");
                    (msg.content, false)
                },
            },
            None => (msg.content, false),
        };

        let queued = QueuedMessage {
            message_id: msg.message_id,
            channel_id: msg.channel_id,
            channel_name: msg.channel_name,
            server_id: msg.server_id,
            author_id: msg.author_id,
            author_name: msg.author_name,
            content,
            encrypted,
            addressed: msg.addressed,
            triggered: msg.triggered,
            watch: msg.watch,
            created_at_ms: now,
            expires_at_ms: now + self.ttl_ms,
        };

        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        let queue = queues.entry(entity_id.to_string()).or_default();
        queue.push_back(queued);
        if queue.len() > self.cap {
            let dropped = queue.len() - self.cap;
            queue.drain(..dropped);
            warn!(entity_id, dropped, "queue cap exceeded, dropped oldest messages");
        }
    }

    /// Read up to `limit` messages. Does not remove anything; only the TTL
    /// sweep does. Encrypted content is decrypted when a key is supplied;
    /// an authentication failure substitutes the key-mismatch sentinel and
    /// keeps the message.
    #[must_use]
    pub fn read(&self, entity_id: &str, opts: &ReadOptions) -> Vec<QueuedMessage> {
        let now = now_ms();
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = queues.get(entity_id) else {
            return Vec::new();
        };

        let eligible: Vec<&QueuedMessage> = queue
            .iter()
            .filter(|m| now <= m.expires_at_ms)
            .filter(|m| {
                opts.channel_id
                    .as_deref()
                    .is_none_or(|c| m.channel_id == c)
            })
            .filter(|m| !opts.triggered_only || m.triggered)
            .collect();

        let skip = eligible.len().saturating_sub(opts.limit);
        eligible
            .into_iter()
            .skip(skip)
            .map(|m| self.unseal(entity_id, m, opts.key.as_ref()))
            .collect()
    }

    fn unseal(
        &self,
        entity_id: &str,
        message: &QueuedMessage,
        key: Option<&[u8; 32]>,
    ) -> QueuedMessage {
        let mut out = message.clone();
        if !out.encrypted {
            return out;
        }
        match key {
            Some(key) => match decrypt_content(key, &out.content) {
                Some(plaintext) => {
                    out.content = plaintext;
                    out.encrypted = false;
                },
                None => {
                    warn!(entity_id, message_id = %out.message_id, "decryption key mismatch");
                    out.content = KEY_MISMATCH_SENTINEL.to_string();
                },
            },
            None => out.content = ENCRYPTED_SENTINEL.to_string(),
        }
        out
    }

    /// Retroactively encrypt plaintext entries in an entity's queue. Runs
    /// when an API-key reader appears after an OAuth-only phase left
    /// plaintext behind. Idempotent: already-encrypted entries are
    /// untouched.
    pub fn encrypt_in_place(&self, entity_id: &str, key: &[u8; 32]) {
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = queues.get_mut(entity_id) else {
            return;
        };
        let mut upgraded = 0usize;
        for message in queue.iter_mut().filter(|m| !m.encrypted) {
            if let Some(ciphertext) = encrypt_content(key, &message.content) {
                message.content = ciphertext;
                message.encrypted = true;
                upgraded += 1;
            }
        }
        if upgraded > 0 {
            debug!(entity_id, upgraded, "retroactively encrypted queued messages");
        }
    }

    /// Drop expired messages and empty queues. One timer per process calls
    /// this; each queue is swapped under a short critical section.
    pub fn sweep(&self) -> usize {
        let now = now_ms();
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        let mut dropped = 0usize;
        queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|m| now <= m.expires_at_ms);
            dropped += before - queue.len();
            !queue.is_empty()
        });
        if dropped > 0 {
            debug!(dropped, "ttl sweep evicted messages");
        }
        dropped
    }

    /// Remove an entity's queue entirely (hard delete).
    pub fn remove_queue(&self, entity_id: &str) {
        self.queues
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(entity_id);
    }

    /// Per-entity queue sizes with oldest-age, for the health endpoint.
    #[must_use]
    pub fn stats(&self) -> Vec<QueueStats> {
        let now = now_ms();
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        let mut stats: Vec<QueueStats> = queues
            .iter()
            .map(|(entity_id, queue)| QueueStats {
                entity_id: entity_id.clone(),
                queued: queue.len(),
                oldest_age_ms: queue
                    .front()
                    .map(|m| now.saturating_sub(m.created_at_ms))
                    .unwrap_or(0),
            })
            .collect();
        stats.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        stats
    }
}
