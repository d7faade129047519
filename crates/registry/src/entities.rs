//! Entity CRUD and API-key lifecycle.

use {
    arachne_common::{Error, Result},
    base64::Engine,
    rand::RngCore,
    tracing::info,
};

use crate::{
    Registry,
    types::{EntityRecord, NewEntity, PlatformTag, UpdateEntity, vec_from_json, vec_to_json},
};

/// bcrypt cost for API-key hashes. Two below the crate default: keeps a
/// cold verification around 40–60 ms, and the key store caches successful
/// verifications so repeated tool calls never re-hash.
pub const BCRYPT_COST: u32 = 10;

pub(crate) const ENTITY_COLUMNS: &str = "id, name, avatar_url, description, accent_color, platform, \
     owner_id, owner_name, api_key_hash, key_salt, triggers, \
     notify_on_mention, notify_on_trigger, active, created_at";

#[derive(sqlx::FromRow)]
pub(crate) struct EntityRow {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) avatar_url: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) accent_color: Option<String>,
    pub(crate) platform: String,
    pub(crate) owner_id: String,
    pub(crate) owner_name: String,
    pub(crate) api_key_hash: String,
    pub(crate) key_salt: String,
    pub(crate) triggers: String,
    pub(crate) notify_on_mention: bool,
    pub(crate) notify_on_trigger: bool,
    pub(crate) active: bool,
    pub(crate) created_at: String,
}

impl EntityRow {
    pub(crate) fn into_record(self) -> Result<EntityRecord> {
        Ok(EntityRecord {
            id: self.id,
            name: self.name,
            avatar_url: self.avatar_url,
            description: self.description,
            accent_color: self.accent_color,
            platform: PlatformTag::parse(&self.platform),
            owner_id: self.owner_id,
            owner_name: self.owner_name,
            api_key_hash: self.api_key_hash,
            key_salt: self.key_salt,
            triggers: vec_from_json(&self.triggers)?,
            notify_on_mention: self.notify_on_mention,
            notify_on_trigger: self.notify_on_trigger,
            active: self.active,
            created_at: self.created_at,
        })
    }
}

impl Registry {
    /// Create an entity. Returns the record together with the raw API key —
    /// the only moment it exists outside the caller's hands.
    pub async fn create_entity(&self, new: NewEntity) -> Result<(EntityRecord, String)> {
        let id = uuid::Uuid::new_v4().to_string();
        let raw_key = generate_api_key();
        let salt = generate_salt();
        let hash = hash_api_key(&raw_key)?;

        sqlx::query(
            "INSERT INTO entities (id, name, avatar_url, description, accent_color, platform, \
             owner_id, owner_name, api_key_hash, key_salt) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.name)
        .bind(&new.avatar_url)
        .bind(&new.description)
        .bind(&new.accent_color)
        .bind(new.platform.as_str())
        .bind(&new.owner_id)
        .bind(&new.owner_name)
        .bind(&hash)
        .bind(&salt)
        .execute(self.pool())
        .await?;

        info!(entity_id = %id, owner_id = %new.owner_id, "entity created");
        let record = self.require_entity(&id).await?;
        Ok((record, raw_key))
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<EntityRecord>> {
        let row: Option<EntityRow> =
            sqlx::query_as(&format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?"))
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        row.map(EntityRow::into_record).transpose()
    }

    pub async fn require_entity(&self, id: &str) -> Result<EntityRecord> {
        self.get_entity(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("entity {id}")))
    }

    pub async fn list_entities(&self) -> Result<Vec<EntityRecord>> {
        let rows: Vec<EntityRow> =
            sqlx::query_as(&format!("SELECT {ENTITY_COLUMNS} FROM entities ORDER BY created_at"))
                .fetch_all(self.pool())
                .await?;
        rows.into_iter().map(EntityRow::into_record).collect()
    }

    pub async fn entities_owned_by(&self, owner_id: &str) -> Result<Vec<EntityRecord>> {
        let rows: Vec<EntityRow> = sqlx::query_as(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE owner_id = ? AND active = 1 \
             ORDER BY created_at"
        ))
        .bind(owner_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(EntityRow::into_record).collect()
    }

    /// Update profile fields; `None` leaves a field unchanged.
    pub async fn update_entity(&self, id: &str, update: UpdateEntity) -> Result<EntityRecord> {
        let current = self.require_entity(id).await?;
        let triggers = update.triggers.unwrap_or(current.triggers);

        sqlx::query(
            "UPDATE entities SET name = ?, avatar_url = ?, description = ?, accent_color = ?, \
             triggers = ?, notify_on_mention = ?, notify_on_trigger = ? WHERE id = ?",
        )
        .bind(update.name.unwrap_or(current.name))
        .bind(update.avatar_url.or(current.avatar_url))
        .bind(update.description.or(current.description))
        .bind(update.accent_color.or(current.accent_color))
        .bind(vec_to_json(&triggers))
        .bind(update.notify_on_mention.unwrap_or(current.notify_on_mention))
        .bind(update.notify_on_trigger.unwrap_or(current.notify_on_trigger))
        .bind(id)
        .execute(self.pool())
        .await?;

        self.require_entity(id).await
    }

    /// Atomically replace the API key. The prior key stops verifying the
    /// moment this returns; the new raw key is returned exactly once.
    pub async fn regenerate_api_key(&self, id: &str) -> Result<String> {
        let raw_key = generate_api_key();
        let salt = generate_salt();
        let hash = hash_api_key(&raw_key)?;

        let result = sqlx::query("UPDATE entities SET api_key_hash = ?, key_salt = ? WHERE id = ?")
            .bind(&hash)
            .bind(&salt)
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("entity {id}")));
        }

        info!(entity_id = %id, "api key regenerated");
        Ok(raw_key)
    }

    /// Soft flag: hides the entity from hot-path queries. The caller is
    /// responsible for purging the key-store slot.
    pub async fn set_entity_active(&self, id: &str, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE entities SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("entity {id}")));
        }
        Ok(())
    }

    /// Hard delete: permission rows, server requests, OAuth artifacts, then
    /// the entity, in one transaction. The caller purges the key-store slot.
    pub async fn delete_entity(&self, id: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM entity_servers WHERE entity_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM server_requests WHERE entity_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM oauth_auth_codes WHERE entity_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM oauth_access_tokens WHERE entity_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM oauth_refresh_tokens WHERE entity_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM entities WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("entity {id}")));
        }
        info!(entity_id = %id, "entity deleted");
        Ok(())
    }
}

/// Verify a raw API key against an entity's stored bcrypt hash.
#[must_use]
pub fn verify_api_key(raw: &str, hash: &str) -> bool {
    bcrypt::verify(raw, hash).unwrap_or(false)
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!(
        "ak_{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    )
}

/// 128-bit salt, hex-encoded. Stored with the entity; the HKDF derivation
/// uses the encoded string's bytes.
fn generate_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hash_api_key(raw: &str) -> Result<String> {
    bcrypt::hash(raw, BCRYPT_COST).map_err(|e| Error::fatal("hashing api key", e))
}
