use std::{collections::HashMap, sync::RwLock};

use arachne_common::time::now_ms;

/// How long a sent message stays attributable to its entity.
pub const ATTRIBUTION_TTL_MS: u64 = 15 * 60 * 1000;

/// `message_id → entity_id` for messages this process posted through
/// webhooks. The router consults it to discard our own events and to
/// attribute edits and reactions; lookup is by id, not by time, so a
/// reaction arriving before the send response returns still resolves.
#[derive(Default)]
pub struct Attribution {
    inner: RwLock<HashMap<String, (String, u64)>>,
}

impl Attribution {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message_id: &str, entity_id: &str) {
        self.insert(message_id, entity_id, now_ms() + ATTRIBUTION_TTL_MS);
    }

    pub(crate) fn insert(&self, message_id: &str, entity_id: &str, expires_at_ms: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        // Opportunistic pruning keeps the map bounded without a timer.
        let now = now_ms();
        inner.retain(|_, (_, expires)| *expires > now);
        inner.insert(message_id.to_string(), (entity_id.to_string(), expires_at_ms));
    }

    #[must_use]
    pub fn entity_for(&self, message_id: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .get(message_id)
            .filter(|(_, expires)| *expires > now_ms())
            .map(|(entity_id, _)| entity_id.clone())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_messages_resolve() {
        let map = Attribution::new();
        map.record("m1", "e1");
        assert_eq!(map.entity_for("m1").as_deref(), Some("e1"));
        assert!(map.entity_for("m2").is_none());
    }

    #[test]
    fn expired_entries_do_not_resolve() {
        let map = Attribution::new();
        map.insert("m1", "e1", now_ms().saturating_sub(1));
        assert!(map.entity_for("m1").is_none());
    }

    #[test]
    fn pruning_clears_expired_entries_on_insert() {
        let map = Attribution::new();
        map.insert("old", "e1", now_ms().saturating_sub(1));
        map.record("new", "e2");
        let inner = map.inner.read().unwrap();
        assert!(!inner.contains_key("old"));
        assert!(inner.contains_key("new"));
    }
}
