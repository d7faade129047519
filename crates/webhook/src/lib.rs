//! Webhook proxy: posts outbound messages through one shared webhook per
//! channel, overriding the username and avatar so each entity appears
//! under its own identity instead of the bot's.

mod attribution;
mod proxy;

pub use {
    attribution::{ATTRIBUTION_TTL_MS, Attribution},
    proxy::{EntityIdentity, WebhookProxy},
};
