//! Interfaces to the chat platform.
//!
//! The core treats the platform as an external collaborator: the router
//! consumes [`GatewayEvent`]s, the webhook proxy and tools speak through
//! [`PlatformApi`] / [`RestToolBackend`], and the OAuth flow verifies owner
//! identity through [`IdentityBroker`]. The Discord-flavoured
//! implementations live here too, so everything above this crate stays
//! platform-shaped rather than Discord-shaped.

pub mod announce;
pub mod events;
pub mod gateway;
pub mod identify;
pub mod rest;

pub use {
    announce::{AnnounceContext, DEFAULT_ANNOUNCE_TEMPLATE, render_announcement},
    events::GatewayEvent,
    identify::{DiscordIdentityBroker, IdentityBroker, PlatformUser},
    rest::{
        AllowedMentions, DiscordRest, PlatformApi, RestToolBackend, SentMessage, Webhook,
        WebhookPost,
    },
};
