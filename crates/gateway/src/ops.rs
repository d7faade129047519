//! Operations that couple the registry with the key store, queues, and
//! platform side-effects: server membership with role lifecycle and join
//! announcements, and the entity lifecycle transitions that must purge
//! volatile state.

use {
    arachne_common::Result,
    arachne_platform::{AnnounceContext, DEFAULT_ANNOUNCE_TEMPLATE, render_announcement},
    arachne_registry::{EntityRecord, EntityServer, ServerRequest, ServerSettings},
    tracing::{info, warn},
};

use crate::state::AppContext;

/// Put an entity on a server: permission row (seeded from the server's
/// default template when one is configured), mention role, and the join
/// announcement. Role creation and the announcement are best-effort; the
/// row is authoritative.
pub async fn join_server(ctx: &AppContext, entity_id: &str, server_id: &str) -> Result<EntityServer> {
    let entity = ctx.registry.require_entity(entity_id).await?;
    let settings = ctx.registry.server_settings(server_id).await?;
    let mut row = ctx.registry.add_entity_server(entity_id, server_id).await?;

    // Fresh rows pick up the server's default template as a live binding.
    let untouched = row.template_id.is_none() && row.channels.is_empty() && row.tools.is_empty();
    if untouched && let Some(template_id) = &settings.default_template_id {
        match ctx
            .registry
            .apply_template(entity_id, server_id, template_id, true)
            .await
        {
            Ok(applied) => row = applied,
            Err(e) => {
                warn!(entity_id, server_id, template_id = %template_id, error = %e,
                      "default template application failed");
            },
        }
    }

    if row.role_id.is_none() {
        match ctx
            .platform
            .create_role(server_id, &entity.name, parse_accent_color(&entity))
            .await
        {
            Ok(role_id) => {
                ctx.registry
                    .set_entity_server_role(entity_id, server_id, Some(&role_id))
                    .await?;
                row.role_id = Some(role_id);
            },
            Err(e) => {
                warn!(entity_id, server_id, error = %e, "mention role creation failed");
            },
        }
    }

    announce_join(ctx, &entity, &row, settings).await;
    info!(entity_id, server_id, "entity joined server");
    Ok(row)
}

/// Remove an entity from a server and delete its mention role. Role
/// deletion is best-effort and never rolls the row back.
pub async fn leave_server(ctx: &AppContext, entity_id: &str, server_id: &str) -> Result<()> {
    let role_id = ctx.registry.remove_entity_server(entity_id, server_id).await?;
    if let Some(role_id) = role_id
        && let Err(e) = ctx.platform.delete_role(server_id, &role_id).await
    {
        warn!(entity_id, server_id, role_id = %role_id, error = %e, "role cleanup failed");
    }
    Ok(())
}

/// Approve a pending join request and perform the join.
pub async fn approve_request(
    ctx: &AppContext,
    request_id: &str,
    reviewer_id: &str,
) -> Result<ServerRequest> {
    let request = ctx.registry.review_request(request_id, true, reviewer_id).await?;
    join_server(ctx, &request.entity_id, &request.server_id).await?;
    Ok(request)
}

pub async fn reject_request(
    ctx: &AppContext,
    request_id: &str,
    reviewer_id: &str,
) -> Result<ServerRequest> {
    ctx.registry.review_request(request_id, false, reviewer_id).await
}

/// Soft-deactivate: the entity disappears from hot-path queries and its
/// derived key is invalidated. Rows and queue stay.
pub async fn deactivate_entity(ctx: &AppContext, entity_id: &str) -> Result<()> {
    ctx.registry.set_entity_active(entity_id, false).await?;
    ctx.keys.remove(entity_id);
    Ok(())
}

/// Hard delete: durable rows, key slot, and queue all go.
pub async fn delete_entity(ctx: &AppContext, entity_id: &str) -> Result<()> {
    ctx.registry.delete_entity(entity_id).await?;
    ctx.keys.remove(entity_id);
    ctx.bus.remove_queue(entity_id);
    Ok(())
}

/// Rotate the API key. The old key and its derived encryption key die
/// here; the new raw key is returned exactly once.
pub async fn regenerate_api_key(ctx: &AppContext, entity_id: &str) -> Result<String> {
    let raw = ctx.registry.regenerate_api_key(entity_id).await?;
    ctx.keys.remove(entity_id);
    Ok(raw)
}

async fn announce_join(
    ctx: &AppContext,
    entity: &EntityRecord,
    row: &EntityServer,
    settings: ServerSettings,
) {
    let channel = row
        .announce_channel_id
        .clone()
        .or(settings.announce_channel_id);
    let Some(channel) = channel else {
        return;
    };

    let template = settings
        .announce_message
        .unwrap_or_else(|| DEFAULT_ANNOUNCE_TEMPLATE.to_string());
    let message = render_announcement(&template, &AnnounceContext {
        name: &entity.name,
        role_id: row.role_id.as_deref(),
        platform: entity.platform.display_name(),
        owner_name: Some(&entity.owner_name),
        owner_id: Some(&entity.owner_id),
    });

    if let Err(e) = ctx.platform.send_channel_message(&channel, &message).await {
        warn!(server_id = %row.server_id, channel_id = %channel, error = %e, "join announcement failed");
    }
}

fn parse_accent_color(entity: &EntityRecord) -> Option<u32> {
    let raw = entity.accent_color.as_deref()?.trim_start_matches('#');
    u32::from_str_radix(raw, 16).ok()
}
