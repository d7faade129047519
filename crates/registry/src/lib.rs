//! Durable store of entities, per-server permissions, templates, server
//! requests, and OAuth artifacts.
//!
//! Single-process, file-backed SQLite. All durable state is owned by this
//! crate; callers never touch SQL directly. Set-valued columns (channel and
//! tool whitelists) are exposed as [`std::collections::BTreeSet`] on the
//! public surface; their JSON encoding is private to this crate.

mod entities;
mod migrations;
mod oauth;
mod servers;
mod types;

use std::{path::Path, time::Duration};

use {
    arachne_common::{Error, Result},
    sqlx::{
        SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    },
};

pub use {
    entities::{BCRYPT_COST, verify_api_key},
    types::{
        AccessTokenRecord, AuthCodeRecord, EntityRecord, EntityRoute, EntityServer, NewEntity,
        OAuthClientRecord, PlatformTag, RefreshTokenRecord, RequestStatus, ServerRequest,
        ServerSettings, ServerTemplate, UpdateEntity,
    },
};

/// Handle to the SQLite-backed registry. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    /// Open (or create) the database file and bring the schema up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| Error::fatal(format!("opening database at {}", path.display()), e))?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool (tests use `sqlite::memory:`) and migrate.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
pub(crate) async fn test_registry() -> Registry {
    #[allow(clippy::unwrap_used)]
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    #[allow(clippy::unwrap_used)]
    Registry::with_pool(pool).await.unwrap()
}
