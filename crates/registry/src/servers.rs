//! Per-server permission rows, hot-path routing queries, server settings,
//! templates, and join requests.

use std::collections::{BTreeSet, HashMap};

use {
    arachne_common::{Error, Result},
    tracing::{info, warn},
};

use crate::{
    Registry,
    entities::{ENTITY_COLUMNS, EntityRow},
    types::{
        EntityRoute, EntityServer, RequestStatus, ServerRequest, ServerSettings, ServerTemplate,
        set_from_json, set_to_json,
    },
};

const ES_COLUMNS: &str = "entity_id, server_id, channels, tools, watch_channels, \
     blocked_channels, role_id, announce_channel_id, template_id";

#[derive(sqlx::FromRow)]
struct EntityServerRow {
    entity_id: String,
    server_id: String,
    channels: String,
    tools: String,
    watch_channels: String,
    blocked_channels: String,
    role_id: Option<String>,
    announce_channel_id: Option<String>,
    template_id: Option<String>,
}

impl EntityServerRow {
    fn into_record(self) -> Result<EntityServer> {
        Ok(EntityServer {
            entity_id: self.entity_id,
            server_id: self.server_id,
            channels: set_from_json(&self.channels)?,
            tools: set_from_json(&self.tools)?,
            watch_channels: set_from_json(&self.watch_channels)?,
            blocked_channels: set_from_json(&self.blocked_channels)?,
            role_id: self.role_id,
            announce_channel_id: self.announce_channel_id,
            template_id: self.template_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RouteRow {
    #[sqlx(flatten)]
    entity: EntityRow,
    #[sqlx(flatten)]
    perms: EntityServerRow,
}

/// Drop watch/blocked entries that fell outside a narrowed ceiling, and
/// re-establish disjointness (watch wins).
fn prune_owner_sets(
    channels: &BTreeSet<String>,
    watch: &mut BTreeSet<String>,
    blocked: &mut BTreeSet<String>,
) {
    if !channels.is_empty() {
        watch.retain(|c| channels.contains(c));
        blocked.retain(|c| channels.contains(c));
    }
    let overlap: Vec<String> = watch.intersection(blocked).cloned().collect();
    for channel in overlap {
        blocked.remove(&channel);
    }
}

impl Registry {
    // ── EntityServer rows ────────────────────────────────────────────────

    /// Add an entity to a server with empty (= all) whitelists. A duplicate
    /// insert is an idempotent no-op with a warning.
    pub async fn add_entity_server(&self, entity_id: &str, server_id: &str) -> Result<EntityServer> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO entity_servers (entity_id, server_id) VALUES (?, ?)",
        )
        .bind(entity_id)
        .bind(server_id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            warn!(entity_id, server_id, "entity already on server, keeping existing row");
        }
        self.require_entity_server(entity_id, server_id).await
    }

    pub async fn get_entity_server(
        &self,
        entity_id: &str,
        server_id: &str,
    ) -> Result<Option<EntityServer>> {
        let row: Option<EntityServerRow> = sqlx::query_as(&format!(
            "SELECT {ES_COLUMNS} FROM entity_servers WHERE entity_id = ? AND server_id = ?"
        ))
        .bind(entity_id)
        .bind(server_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(EntityServerRow::into_record).transpose()
    }

    pub async fn require_entity_server(
        &self,
        entity_id: &str,
        server_id: &str,
    ) -> Result<EntityServer> {
        self.get_entity_server(entity_id, server_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("entity {entity_id} on server {server_id}")))
    }

    pub async fn list_entity_servers(&self, entity_id: &str) -> Result<Vec<EntityServer>> {
        let rows: Vec<EntityServerRow> = sqlx::query_as(&format!(
            "SELECT {ES_COLUMNS} FROM entity_servers WHERE entity_id = ? ORDER BY server_id"
        ))
        .bind(entity_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(EntityServerRow::into_record).collect()
    }

    /// Admin ceiling update. Prunes owner sets that fall outside the new
    /// whitelist and detaches any template binding.
    pub async fn set_admin_permissions(
        &self,
        entity_id: &str,
        server_id: &str,
        channels: BTreeSet<String>,
        tools: BTreeSet<String>,
    ) -> Result<EntityServer> {
        let current = self.require_entity_server(entity_id, server_id).await?;
        let mut watch = current.watch_channels;
        let mut blocked = current.blocked_channels;
        prune_owner_sets(&channels, &mut watch, &mut blocked);

        sqlx::query(
            "UPDATE entity_servers SET channels = ?, tools = ?, watch_channels = ?, \
             blocked_channels = ?, template_id = NULL \
             WHERE entity_id = ? AND server_id = ?",
        )
        .bind(set_to_json(&channels))
        .bind(set_to_json(&tools))
        .bind(set_to_json(&watch))
        .bind(set_to_json(&blocked))
        .bind(entity_id)
        .bind(server_id)
        .execute(self.pool())
        .await?;

        self.require_entity_server(entity_id, server_id).await
    }

    /// Owner tuning. Rejects sets that escape the admin ceiling or overlap
    /// each other; the invariants are re-established before commit, never
    /// after.
    pub async fn set_owner_channels(
        &self,
        entity_id: &str,
        server_id: &str,
        watch: BTreeSet<String>,
        blocked: BTreeSet<String>,
    ) -> Result<EntityServer> {
        let current = self.require_entity_server(entity_id, server_id).await?;

        for channel in watch.union(&blocked) {
            if !current.allows_channel(channel) {
                return Err(Error::bad_request(format!(
                    "channel {channel} is outside the admin whitelist"
                )));
            }
        }
        if let Some(channel) = watch.intersection(&blocked).next() {
            return Err(Error::bad_request(format!(
                "channel {channel} cannot be both watched and blocked"
            )));
        }

        sqlx::query(
            "UPDATE entity_servers SET watch_channels = ?, blocked_channels = ? \
             WHERE entity_id = ? AND server_id = ?",
        )
        .bind(set_to_json(&watch))
        .bind(set_to_json(&blocked))
        .bind(entity_id)
        .bind(server_id)
        .execute(self.pool())
        .await?;

        self.require_entity_server(entity_id, server_id).await
    }

    pub async fn set_entity_server_role(
        &self,
        entity_id: &str,
        server_id: &str,
        role_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE entity_servers SET role_id = ? WHERE entity_id = ? AND server_id = ?",
        )
        .bind(role_id)
        .bind(entity_id)
        .bind(server_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_entity_server_announce_channel(
        &self,
        entity_id: &str,
        server_id: &str,
        channel_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE entity_servers SET announce_channel_id = ? \
             WHERE entity_id = ? AND server_id = ?",
        )
        .bind(channel_id)
        .bind(entity_id)
        .bind(server_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Remove the row and hand back the role id so the caller can delete the
    /// platform role (best-effort, outside this transaction).
    pub async fn remove_entity_server(
        &self,
        entity_id: &str,
        server_id: &str,
    ) -> Result<Option<String>> {
        let current = self.require_entity_server(entity_id, server_id).await?;
        sqlx::query("DELETE FROM entity_servers WHERE entity_id = ? AND server_id = ?")
            .bind(entity_id)
            .bind(server_id)
            .execute(self.pool())
            .await?;
        info!(entity_id, server_id, "entity removed from server");
        Ok(current.role_id)
    }

    // ── Hot-path queries ─────────────────────────────────────────────────

    /// Every active entity whose whitelist admits this channel, joined with
    /// its permission row. One indexed query on `entity_servers.server_id`;
    /// the whitelist check runs on the fetched rows, never over all
    /// entities.
    pub async fn entities_for_channel(
        &self,
        server_id: &str,
        channel_id: &str,
    ) -> Result<Vec<EntityRoute>> {
        let rows: Vec<RouteRow> = sqlx::query_as(&format!(
            "SELECT {ENTITY_COLUMNS}, {ES_COLUMNS} \
             FROM entity_servers es JOIN entities e ON e.id = es.entity_id \
             WHERE es.server_id = ? AND e.active = 1"
        ))
        .bind(server_id)
        .fetch_all(self.pool())
        .await?;

        let mut routes = Vec::with_capacity(rows.len());
        for row in rows {
            let perms = row.perms.into_record()?;
            if !perms.allows_channel(channel_id) {
                continue;
            }
            routes.push(EntityRoute {
                entity: row.entity.into_record()?,
                perms,
            });
        }
        Ok(routes)
    }

    /// `role_id → entity_id` for active entities on a server; resolves
    /// @-mentions of entity roles.
    pub async fn role_entity_map(&self, server_id: &str) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT es.role_id, es.entity_id \
             FROM entity_servers es JOIN entities e ON e.id = es.entity_id \
             WHERE es.server_id = ? AND e.active = 1 AND es.role_id IS NOT NULL",
        )
        .bind(server_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().collect())
    }

    // ── Server settings ──────────────────────────────────────────────────

    pub async fn server_settings(&self, server_id: &str) -> Result<ServerSettings> {
        let row: Option<(Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT announce_channel_id, announce_message, default_template_id \
             FROM server_settings WHERE server_id = ?",
        )
        .bind(server_id)
        .fetch_optional(self.pool())
        .await?;
        let (announce_channel_id, announce_message, default_template_id) =
            row.unwrap_or((None, None, None));
        Ok(ServerSettings {
            server_id: server_id.to_string(),
            announce_channel_id,
            announce_message,
            default_template_id,
        })
    }

    pub async fn set_server_settings(&self, settings: &ServerSettings) -> Result<()> {
        sqlx::query(
            "INSERT INTO server_settings \
             (server_id, announce_channel_id, announce_message, default_template_id) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(server_id) DO UPDATE SET \
             announce_channel_id = excluded.announce_channel_id, \
             announce_message = excluded.announce_message, \
             default_template_id = excluded.default_template_id",
        )
        .bind(&settings.server_id)
        .bind(&settings.announce_channel_id)
        .bind(&settings.announce_message)
        .bind(&settings.default_template_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ── Templates ────────────────────────────────────────────────────────

    pub async fn create_template(
        &self,
        server_id: &str,
        name: &str,
        channels: BTreeSet<String>,
        tools: BTreeSet<String>,
    ) -> Result<ServerTemplate> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO server_templates (id, server_id, name, channels, tools) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(server_id)
        .bind(name)
        .bind(set_to_json(&channels))
        .bind(set_to_json(&tools))
        .execute(self.pool())
        .await?;
        Ok(ServerTemplate {
            id,
            server_id: server_id.to_string(),
            name: name.to_string(),
            channels,
            tools,
        })
    }

    pub async fn get_template(&self, id: &str) -> Result<Option<ServerTemplate>> {
        let row: Option<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, server_id, name, channels, tools FROM server_templates WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|(id, server_id, name, channels, tools)| {
            Ok(ServerTemplate {
                id,
                server_id,
                name,
                channels: set_from_json(&channels)?,
                tools: set_from_json(&tools)?,
            })
        })
        .transpose()
    }

    pub async fn list_templates(&self, server_id: &str) -> Result<Vec<ServerTemplate>> {
        let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, server_id, name, channels, tools FROM server_templates \
             WHERE server_id = ? ORDER BY name",
        )
        .bind(server_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|(id, server_id, name, channels, tools)| {
                Ok(ServerTemplate {
                    id,
                    server_id,
                    name,
                    channels: set_from_json(&channels)?,
                    tools: set_from_json(&tools)?,
                })
            })
            .collect()
    }

    /// Edit a template and propagate the new sets to every row still bound
    /// to it, pruning owner sets that fall outside the new ceiling.
    pub async fn update_template(
        &self,
        id: &str,
        channels: BTreeSet<String>,
        tools: BTreeSet<String>,
    ) -> Result<ServerTemplate> {
        let result = sqlx::query("UPDATE server_templates SET channels = ?, tools = ? WHERE id = ?")
            .bind(set_to_json(&channels))
            .bind(set_to_json(&tools))
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("template {id}")));
        }

        let bound: Vec<EntityServerRow> = sqlx::query_as(&format!(
            "SELECT {ES_COLUMNS} FROM entity_servers WHERE template_id = ?"
        ))
        .bind(id)
        .fetch_all(self.pool())
        .await?;

        for row in bound {
            let perms = row.into_record()?;
            let mut watch = perms.watch_channels;
            let mut blocked = perms.blocked_channels;
            prune_owner_sets(&channels, &mut watch, &mut blocked);
            sqlx::query(
                "UPDATE entity_servers SET channels = ?, tools = ?, watch_channels = ?, \
                 blocked_channels = ? WHERE entity_id = ? AND server_id = ?",
            )
            .bind(set_to_json(&channels))
            .bind(set_to_json(&tools))
            .bind(set_to_json(&watch))
            .bind(set_to_json(&blocked))
            .bind(&perms.entity_id)
            .bind(&perms.server_id)
            .execute(self.pool())
            .await?;
        }

        self.get_template(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("template {id}")))
    }

    /// Delete a template, detaching bound rows and any default reference.
    pub async fn delete_template(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE entity_servers SET template_id = NULL WHERE template_id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        sqlx::query(
            "UPDATE server_settings SET default_template_id = NULL WHERE default_template_id = ?",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        sqlx::query("DELETE FROM server_templates WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Copy a template's sets onto a permission row. With `bind`, the row
    /// records the template id and follows future edits; a plain apply is a
    /// one-shot copy.
    pub async fn apply_template(
        &self,
        entity_id: &str,
        server_id: &str,
        template_id: &str,
        bind: bool,
    ) -> Result<EntityServer> {
        let template = self
            .get_template(template_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("template {template_id}")))?;
        let current = self.require_entity_server(entity_id, server_id).await?;

        let mut watch = current.watch_channels;
        let mut blocked = current.blocked_channels;
        prune_owner_sets(&template.channels, &mut watch, &mut blocked);

        sqlx::query(
            "UPDATE entity_servers SET channels = ?, tools = ?, watch_channels = ?, \
             blocked_channels = ?, template_id = ? WHERE entity_id = ? AND server_id = ?",
        )
        .bind(set_to_json(&template.channels))
        .bind(set_to_json(&template.tools))
        .bind(set_to_json(&watch))
        .bind(set_to_json(&blocked))
        .bind(bind.then_some(template_id))
        .bind(entity_id)
        .bind(server_id)
        .execute(self.pool())
        .await?;

        self.require_entity_server(entity_id, server_id).await
    }

    // ── Server requests ──────────────────────────────────────────────────

    /// File a join request. An existing pending request for the same pair is
    /// returned as-is with a warning.
    pub async fn create_server_request(
        &self,
        entity_id: &str,
        server_id: &str,
        requester_id: &str,
        requester_name: &str,
    ) -> Result<ServerRequest> {
        if let Some(existing) = self.pending_request(entity_id, server_id).await? {
            warn!(entity_id, server_id, "join request already pending");
            return Ok(existing);
        }

        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO server_requests (id, entity_id, server_id, requester_id, requester_name) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(entity_id)
        .bind(server_id)
        .bind(requester_id)
        .bind(requester_name)
        .execute(self.pool())
        .await?;
        self.require_request(&id).await
    }

    /// Approve or reject. Terminal states are write-once: reviewing anything
    /// but a pending request is a conflict.
    pub async fn review_request(
        &self,
        request_id: &str,
        approve: bool,
        reviewer_id: &str,
    ) -> Result<ServerRequest> {
        let status = if approve {
            RequestStatus::Approved
        } else {
            RequestStatus::Rejected
        };
        let result = sqlx::query(
            "UPDATE server_requests SET status = ?, reviewer_id = ?, \
             reviewed_at = datetime('now') WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(reviewer_id)
        .bind(request_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            let current = self.require_request(request_id).await?;
            return Err(Error::conflict(format!(
                "request {request_id} already {}",
                current.status.as_str()
            )));
        }
        self.require_request(request_id).await
    }

    pub async fn list_server_requests(
        &self,
        server_id: &str,
        status: Option<RequestStatus>,
    ) -> Result<Vec<ServerRequest>> {
        let rows: Vec<RequestRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT id, entity_id, server_id, status, requester_id, requester_name, \
                     reviewer_id, created_at, reviewed_at FROM server_requests \
                     WHERE server_id = ? AND status = ? ORDER BY created_at",
                )
                .bind(server_id)
                .bind(status.as_str())
                .fetch_all(self.pool())
                .await?
            },
            None => {
                sqlx::query_as(
                    "SELECT id, entity_id, server_id, status, requester_id, requester_name, \
                     reviewer_id, created_at, reviewed_at FROM server_requests \
                     WHERE server_id = ? ORDER BY created_at",
                )
                .bind(server_id)
                .fetch_all(self.pool())
                .await?
            },
        };
        Ok(rows.into_iter().map(RequestRow::into_record).collect())
    }

    async fn pending_request(
        &self,
        entity_id: &str,
        server_id: &str,
    ) -> Result<Option<ServerRequest>> {
        let row: Option<RequestRow> = sqlx::query_as(
            "SELECT id, entity_id, server_id, status, requester_id, requester_name, \
             reviewer_id, created_at, reviewed_at FROM server_requests \
             WHERE entity_id = ? AND server_id = ? AND status = 'pending'",
        )
        .bind(entity_id)
        .bind(server_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(RequestRow::into_record))
    }

    async fn require_request(&self, id: &str) -> Result<ServerRequest> {
        let row: Option<RequestRow> = sqlx::query_as(
            "SELECT id, entity_id, server_id, status, requester_id, requester_name, \
             reviewer_id, created_at, reviewed_at FROM server_requests WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(RequestRow::into_record)
            .ok_or_else(|| Error::not_found(format!("request {id}")))
    }
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: String,
    entity_id: String,
    server_id: String,
    status: String,
    requester_id: String,
    requester_name: String,
    reviewer_id: Option<String>,
    created_at: String,
    reviewed_at: Option<String>,
}

impl RequestRow {
    fn into_record(self) -> ServerRequest {
        ServerRequest {
            id: self.id,
            entity_id: self.entity_id,
            server_id: self.server_id,
            status: RequestStatus::parse(&self.status),
            requester_id: self.requester_id,
            requester_name: self.requester_name,
            reviewer_id: self.reviewer_id,
            created_at: self.created_at,
            reviewed_at: self.reviewed_at,
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{test_registry, types::NewEntity, types::PlatformTag},
    };

    async fn seed_entity(registry: &Registry, name: &str) -> String {
        let (entity, _) = registry
            .create_entity(NewEntity {
                name: name.into(),
                avatar_url: None,
                description: None,
                accent_color: None,
                platform: PlatformTag::Claude,
                owner_id: "owner-1".into(),
                owner_name: "Owner".into(),
            })
            .await
            .unwrap();
        entity.id
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn fan_out_eligibility_follows_whitelist() {
        let registry = test_registry().await;
        let a = seed_entity(&registry, "A").await;
        let b = seed_entity(&registry, "B").await;

        registry.add_entity_server(&a, "s1").await.unwrap();
        registry.add_entity_server(&b, "s1").await.unwrap();
        registry
            .set_admin_permissions(&b, "s1", set(&["c1"]), BTreeSet::new())
            .await
            .unwrap();

        // c1: both eligible (A has the empty whitelist).
        let routes = registry.entities_for_channel("s1", "c1").await.unwrap();
        let ids: Vec<&str> = routes.iter().map(|r| r.entity.id.as_str()).collect();
        assert!(ids.contains(&a.as_str()) && ids.contains(&b.as_str()));

        // c2: only A.
        let routes = registry.entities_for_channel("s1", "c2").await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].entity.id, a);

        // Deactivated entities drop out of the hot path.
        registry.set_entity_active(&a, false).await.unwrap();
        let routes = registry.entities_for_channel("s1", "c2").await.unwrap();
        assert!(routes.is_empty());
    }

    #[tokio::test]
    async fn owner_sets_must_stay_inside_ceiling_and_disjoint() {
        let registry = test_registry().await;
        let a = seed_entity(&registry, "A").await;
        registry.add_entity_server(&a, "s1").await.unwrap();
        registry
            .set_admin_permissions(&a, "s1", set(&["c1", "c2"]), BTreeSet::new())
            .await
            .unwrap();

        // c3 is outside the ceiling.
        let err = registry
            .set_owner_channels(&a, "s1", set(&["c1", "c3"]), BTreeSet::new())
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);

        // Overlapping watch/blocked is rejected.
        let err = registry
            .set_owner_channels(&a, "s1", set(&["c1"]), set(&["c1"]))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);

        // Valid tuning commits.
        let row = registry
            .set_owner_channels(&a, "s1", set(&["c1"]), set(&["c2"]))
            .await
            .unwrap();
        assert_eq!(row.watch_channels, set(&["c1"]));
        assert_eq!(row.blocked_channels, set(&["c2"]));
    }

    #[tokio::test]
    async fn narrowing_ceiling_prunes_owner_sets() {
        let registry = test_registry().await;
        let a = seed_entity(&registry, "A").await;
        registry.add_entity_server(&a, "s1").await.unwrap();
        registry
            .set_admin_permissions(&a, "s1", set(&["c1", "c2"]), BTreeSet::new())
            .await
            .unwrap();
        registry
            .set_owner_channels(&a, "s1", set(&["c1", "c2"]), BTreeSet::new())
            .await
            .unwrap();

        let row = registry
            .set_admin_permissions(&a, "s1", set(&["c1"]), BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(row.watch_channels, set(&["c1"]));
    }

    #[tokio::test]
    async fn manual_edit_detaches_template_binding() {
        let registry = test_registry().await;
        let a = seed_entity(&registry, "A").await;
        registry.add_entity_server(&a, "s1").await.unwrap();
        let template = registry
            .create_template("s1", "default", set(&["c1", "c2"]), set(&["read_messages"]))
            .await
            .unwrap();

        let row = registry
            .apply_template(&a, "s1", &template.id, true)
            .await
            .unwrap();
        assert_eq!(row.template_id.as_deref(), Some(template.id.as_str()));
        assert_eq!(row.channels, set(&["c1", "c2"]));

        // Bound rows follow template edits.
        registry
            .update_template(&template.id, set(&["c1"]), set(&["read_messages"]))
            .await
            .unwrap();
        let row = registry.require_entity_server(&a, "s1").await.unwrap();
        assert_eq!(row.channels, set(&["c1"]));

        // A manual admin edit detaches the binding.
        registry
            .set_admin_permissions(&a, "s1", set(&["c1", "c3"]), BTreeSet::new())
            .await
            .unwrap();
        let row = registry.require_entity_server(&a, "s1").await.unwrap();
        assert!(row.template_id.is_none());

        // Later template edits no longer propagate.
        registry
            .update_template(&template.id, set(&["c9"]), BTreeSet::new())
            .await
            .unwrap();
        let row = registry.require_entity_server(&a, "s1").await.unwrap();
        assert_eq!(row.channels, set(&["c1", "c3"]));
    }

    #[tokio::test]
    async fn applied_template_without_bind_is_one_shot() {
        let registry = test_registry().await;
        let a = seed_entity(&registry, "A").await;
        registry.add_entity_server(&a, "s1").await.unwrap();
        let template = registry
            .create_template("s1", "preset", set(&["c1"]), BTreeSet::new())
            .await
            .unwrap();

        let row = registry
            .apply_template(&a, "s1", &template.id, false)
            .await
            .unwrap();
        assert!(row.template_id.is_none());

        registry
            .update_template(&template.id, set(&["c2"]), BTreeSet::new())
            .await
            .unwrap();
        let row = registry.require_entity_server(&a, "s1").await.unwrap();
        assert_eq!(row.channels, set(&["c1"]));
    }

    #[tokio::test]
    async fn role_map_only_lists_assigned_roles() {
        let registry = test_registry().await;
        let a = seed_entity(&registry, "A").await;
        let b = seed_entity(&registry, "B").await;
        registry.add_entity_server(&a, "s1").await.unwrap();
        registry.add_entity_server(&b, "s1").await.unwrap();
        registry
            .set_entity_server_role(&a, "s1", Some("role-a"))
            .await
            .unwrap();

        let map = registry.role_entity_map("s1").await.unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("role-a").map(String::as_str), Some(a.as_str()));
    }

    #[tokio::test]
    async fn request_review_is_write_once() {
        let registry = test_registry().await;
        let a = seed_entity(&registry, "A").await;
        let request = registry
            .create_server_request(&a, "s1", "u-req", "Requester")
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Pending);

        // Duplicate filing returns the pending request.
        let again = registry
            .create_server_request(&a, "s1", "u-req", "Requester")
            .await
            .unwrap();
        assert_eq!(again.id, request.id);

        let reviewed = registry
            .review_request(&request.id, true, "u-admin")
            .await
            .unwrap();
        assert_eq!(reviewed.status, RequestStatus::Approved);
        assert_eq!(reviewed.reviewer_id.as_deref(), Some("u-admin"));

        // Terminal state is write-once.
        let err = registry
            .review_request(&request.id, false, "u-admin")
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn remove_entity_server_returns_role_for_cleanup() {
        let registry = test_registry().await;
        let a = seed_entity(&registry, "A").await;
        registry.add_entity_server(&a, "s1").await.unwrap();
        registry
            .set_entity_server_role(&a, "s1", Some("role-a"))
            .await
            .unwrap();

        let role = registry.remove_entity_server(&a, "s1").await.unwrap();
        assert_eq!(role.as_deref(), Some("role-a"));
        assert!(registry.get_entity_server(&a, "s1").await.unwrap().is_none());
    }
}
