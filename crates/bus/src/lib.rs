//! Per-entity encrypted message bus and the volatile key store.
//!
//! Queue contents live only in memory: a restart empties every queue by
//! definition, and the AI client falls back to live channel history. The
//! bus never back-pressures the router — overflow drops the oldest
//! messages with a warning.

mod crypto;
mod keystore;
mod queue;

pub use {
    crypto::{decrypt_content, encrypt_content},
    keystore::{KeyStore, derive_key},
    queue::{
        BusConfig, ENCRYPTED_SENTINEL, InboundMessage, KEY_MISMATCH_SENTINEL, MessageBus,
        QueueStats, QueuedMessage, ReadOptions,
    },
};
