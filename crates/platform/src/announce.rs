//! Join-announcement template rendering.
//!
//! Placeholders are literal: `{name}`, `{mention}`, `{platform}`,
//! `{owner}`, `{owner_mention}`. A line containing `{platform}` or
//! `{owner_mention}` is removed entirely when the value is absent.

/// Template used when a server has not configured its own.
pub const DEFAULT_ANNOUNCE_TEMPLATE: &str = "**{name}** ({platform}) has joined this server. \
     You can mention them with {mention}.\nPartnered with **{owner}**";

/// Values available to one announcement.
#[derive(Debug, Clone, Default)]
pub struct AnnounceContext<'a> {
    pub name: &'a str,
    pub role_id: Option<&'a str>,
    /// Capitalized platform tag; `None` removes lines naming it.
    pub platform: Option<&'a str>,
    pub owner_name: Option<&'a str>,
    pub owner_id: Option<&'a str>,
}

/// Substitute placeholders line by line. Substitution is idempotent for
/// any template without placeholders.
#[must_use]
pub fn render_announcement(template: &str, ctx: &AnnounceContext<'_>) -> String {
    let mention = ctx
        .role_id
        .map(|role| format!("<@&{role}>"))
        .unwrap_or_else(|| format!("**{}**", ctx.name));
    let owner_mention = ctx.owner_id.map(|id| format!("<@{id}>"));

    template
        .lines()
        .filter(|line| !(line.contains("{platform}") && ctx.platform.is_none()))
        .filter(|line| !(line.contains("{owner_mention}") && owner_mention.is_none()))
        .map(|line| {
            line.replace("{name}", ctx.name)
                .replace("{mention}", &mention)
                .replace("{platform}", ctx.platform.unwrap_or_default())
                .replace("{owner}", ctx.owner_name.unwrap_or("unknown"))
                .replace("{owner_mention}", owner_mention.as_deref().unwrap_or_default())
        })
        .collect::<Vec<_>>()
        .join("\n")
}
