//! Schema bootstrap and additive migrations.
//!
//! The bootstrap DDL is the original v1 schema; every column added since
//! lives in [`ADDITIVE_COLUMNS`] and is applied by inspecting the schema
//! catalog, so older databases upgrade in place. Migrations never drop or
//! rewrite columns.

use std::collections::HashSet;

use {
    arachne_common::Result,
    sqlx::{Row, SqlitePool},
    tracing::info,
};

const BOOTSTRAP: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS entities (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        avatar_url TEXT,
        description TEXT,
        platform TEXT NOT NULL DEFAULT 'other',
        owner_id TEXT NOT NULL,
        owner_name TEXT NOT NULL DEFAULT '',
        api_key_hash TEXT NOT NULL,
        key_salt TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE TABLE IF NOT EXISTS entity_servers (
        entity_id TEXT NOT NULL,
        server_id TEXT NOT NULL,
        channels TEXT NOT NULL DEFAULT '[]',
        tools TEXT NOT NULL DEFAULT '[]',
        watch_channels TEXT NOT NULL DEFAULT '[]',
        blocked_channels TEXT NOT NULL DEFAULT '[]',
        role_id TEXT,
        PRIMARY KEY (entity_id, server_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_entity_servers_server
        ON entity_servers(server_id)",
    "CREATE TABLE IF NOT EXISTS server_settings (
        server_id TEXT PRIMARY KEY,
        announce_channel_id TEXT,
        announce_message TEXT
    )",
    "CREATE TABLE IF NOT EXISTS server_templates (
        id TEXT PRIMARY KEY,
        server_id TEXT NOT NULL,
        name TEXT NOT NULL,
        channels TEXT NOT NULL DEFAULT '[]',
        tools TEXT NOT NULL DEFAULT '[]'
    )",
    "CREATE TABLE IF NOT EXISTS server_requests (
        id TEXT PRIMARY KEY,
        entity_id TEXT NOT NULL,
        server_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        requester_id TEXT NOT NULL,
        requester_name TEXT NOT NULL DEFAULT '',
        reviewer_id TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        reviewed_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_server_requests_server
        ON server_requests(server_id)",
    "CREATE TABLE IF NOT EXISTS oauth_clients (
        id TEXT PRIMARY KEY,
        name TEXT,
        redirect_uris TEXT NOT NULL,
        grant_types TEXT NOT NULL DEFAULT '[\"authorization_code\",\"refresh_token\"]',
        response_types TEXT NOT NULL DEFAULT '[\"code\"]',
        token_endpoint_auth_method TEXT NOT NULL DEFAULT 'none',
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS oauth_auth_codes (
        code TEXT PRIMARY KEY,
        client_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        redirect_uri TEXT NOT NULL,
        code_challenge TEXT NOT NULL,
        scope TEXT NOT NULL DEFAULT 'mcp',
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS oauth_access_tokens (
        jti TEXT PRIMARY KEY,
        entity_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        client_id TEXT NOT NULL,
        scope TEXT NOT NULL DEFAULT 'mcp',
        expires_at INTEGER NOT NULL,
        revoked INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS oauth_refresh_tokens (
        token TEXT PRIMARY KEY,
        jti TEXT NOT NULL,
        client_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        scope TEXT NOT NULL DEFAULT 'mcp',
        expires_at INTEGER NOT NULL
    )",
];

/// Columns added after the v1 schema: (table, column, column DDL).
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("entities", "accent_color", "TEXT"),
    ("entities", "triggers", "TEXT NOT NULL DEFAULT '[]'"),
    ("entities", "notify_on_mention", "INTEGER NOT NULL DEFAULT 0"),
    ("entities", "notify_on_trigger", "INTEGER NOT NULL DEFAULT 0"),
    ("entity_servers", "announce_channel_id", "TEXT"),
    ("entity_servers", "template_id", "TEXT"),
    ("server_settings", "default_template_id", "TEXT"),
];

pub(crate) async fn run(pool: &SqlitePool) -> Result<()> {
    for ddl in BOOTSTRAP {
        sqlx::query(ddl).execute(pool).await?;
    }

    for (table, column, ddl) in ADDITIVE_COLUMNS {
        let existing = table_columns(pool, table).await?;
        if existing.contains(*column) {
            continue;
        }
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"))
            .execute(pool)
            .await?;
        info!(table, column, "applied schema migration");
    }

    Ok(())
}

async fn table_columns(pool: &SqlitePool, table: &str) -> Result<HashSet<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| row.get::<String, _>("name"))
        .collect())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migration_is_idempotent() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run(&pool).await.unwrap();
        run(&pool).await.unwrap();

        let columns = table_columns(&pool, "entities").await.unwrap();
        assert!(columns.contains("accent_color"));
        assert!(columns.contains("triggers"));
        assert!(columns.contains("notify_on_trigger"));
    }

    #[tokio::test]
    async fn v1_database_upgrades_in_place() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        // Only the v1 tables, no additive columns.
        for ddl in BOOTSTRAP {
            sqlx::query(ddl).execute(&pool).await.unwrap();
        }
        let before = table_columns(&pool, "entity_servers").await.unwrap();
        assert!(!before.contains("template_id"));

        run(&pool).await.unwrap();
        let after = table_columns(&pool, "entity_servers").await.unwrap();
        assert!(after.contains("template_id"));
        assert!(after.contains("announce_channel_id"));
    }
}
