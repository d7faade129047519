//! OAuth artifact storage: dynamically registered clients, one-time
//! authorization codes, access-token revocation bookkeeping, and single-use
//! refresh tokens.

use {
    arachne_common::{Error, Result},
    tracing::info,
};

use crate::{
    Registry,
    types::{
        AccessTokenRecord, AuthCodeRecord, OAuthClientRecord, RefreshTokenRecord, vec_from_json,
        vec_to_json,
    },
};

impl Registry {
    // ── Clients ──────────────────────────────────────────────────────────

    pub async fn create_oauth_client(
        &self,
        name: Option<&str>,
        redirect_uris: &[String],
        grant_types: &[String],
        response_types: &[String],
        token_endpoint_auth_method: &str,
        created_at: i64,
    ) -> Result<OAuthClientRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO oauth_clients \
             (id, name, redirect_uris, grant_types, response_types, \
              token_endpoint_auth_method, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(vec_to_json(redirect_uris))
        .bind(vec_to_json(grant_types))
        .bind(vec_to_json(response_types))
        .bind(token_endpoint_auth_method)
        .bind(created_at)
        .execute(self.pool())
        .await?;

        info!(client_id = %id, "oauth client registered");
        self.get_oauth_client(&id)
            .await?
            .ok_or_else(|| Error::not_found(format!("oauth client {id}")))
    }

    pub async fn get_oauth_client(&self, id: &str) -> Result<Option<OAuthClientRecord>> {
        let row: Option<(String, Option<String>, String, String, String, String, i64)> =
            sqlx::query_as(
                "SELECT id, name, redirect_uris, grant_types, response_types, \
                 token_endpoint_auth_method, created_at FROM oauth_clients WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(
            |(id, name, redirect_uris, grant_types, response_types, auth_method, created_at)| {
                Ok(OAuthClientRecord {
                    id,
                    name,
                    redirect_uris: vec_from_json(&redirect_uris)?,
                    grant_types: vec_from_json(&grant_types)?,
                    response_types: vec_from_json(&response_types)?,
                    token_endpoint_auth_method: auth_method,
                    created_at,
                })
            },
        )
        .transpose()
    }

    // ── Authorization codes ──────────────────────────────────────────────

    pub async fn insert_auth_code(&self, code: &AuthCodeRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO oauth_auth_codes \
             (code, client_id, entity_id, user_id, redirect_uri, code_challenge, scope, \
              expires_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&code.code)
        .bind(&code.client_id)
        .bind(&code.entity_id)
        .bind(&code.user_id)
        .bind(&code.redirect_uri)
        .bind(&code.code_challenge)
        .bind(&code.scope)
        .bind(code.expires_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Destructive fetch: the code is deleted whether or not it is still
    /// valid, so a second consume always returns `None`.
    pub async fn consume_auth_code(&self, code: &str, now: i64) -> Result<Option<AuthCodeRecord>> {
        let mut tx = self.pool().begin().await?;
        let row: Option<(String, String, String, String, String, String, String, i64)> =
            sqlx::query_as(
                "SELECT code, client_id, entity_id, user_id, redirect_uri, code_challenge, \
                 scope, expires_at FROM oauth_auth_codes WHERE code = ?",
            )
            .bind(code)
            .fetch_optional(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM oauth_auth_codes WHERE code = ?")
            .bind(code)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(row.and_then(
            |(code, client_id, entity_id, user_id, redirect_uri, code_challenge, scope, expires_at)| {
                (expires_at > now).then_some(AuthCodeRecord {
                    code,
                    client_id,
                    entity_id,
                    user_id,
                    redirect_uri,
                    code_challenge,
                    scope,
                    expires_at,
                })
            },
        ))
    }

    // ── Access tokens (revocation bookkeeping) ───────────────────────────

    pub async fn record_access_token(&self, token: &AccessTokenRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO oauth_access_tokens \
             (jti, entity_id, user_id, client_id, scope, expires_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&token.jti)
        .bind(&token.entity_id)
        .bind(&token.user_id)
        .bind(&token.client_id)
        .bind(&token.scope)
        .bind(token.expires_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Whether the jti exists, is unrevoked, and is unexpired. Unknown jtis
    /// count as revoked.
    pub async fn is_token_active(&self, jti: &str, now: i64) -> Result<bool> {
        let row: Option<(bool, i64)> =
            sqlx::query_as("SELECT revoked, expires_at FROM oauth_access_tokens WHERE jti = ?")
                .bind(jti)
                .fetch_optional(self.pool())
                .await?;
        Ok(matches!(row, Some((false, expires_at)) if expires_at > now))
    }

    pub async fn revoke_token(&self, jti: &str) -> Result<()> {
        sqlx::query("UPDATE oauth_access_tokens SET revoked = 1 WHERE jti = ?")
            .bind(jti)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ── Refresh tokens ───────────────────────────────────────────────────

    pub async fn insert_refresh_token(&self, token: &RefreshTokenRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO oauth_refresh_tokens \
             (token, jti, client_id, entity_id, user_id, scope, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&token.token)
        .bind(&token.jti)
        .bind(&token.client_id)
        .bind(&token.entity_id)
        .bind(&token.user_id)
        .bind(&token.scope)
        .bind(token.expires_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Single-use: the row is deleted on fetch; expired tokens return
    /// `None`.
    pub async fn consume_refresh_token(
        &self,
        token: &str,
        now: i64,
    ) -> Result<Option<RefreshTokenRecord>> {
        let mut tx = self.pool().begin().await?;
        let row: Option<(String, String, String, String, String, String, i64)> = sqlx::query_as(
            "SELECT token, jti, client_id, entity_id, user_id, scope, expires_at \
             FROM oauth_refresh_tokens WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM oauth_refresh_tokens WHERE token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(row.and_then(
            |(token, jti, client_id, entity_id, user_id, scope, expires_at)| {
                (expires_at > now).then_some(RefreshTokenRecord {
                    token,
                    jti,
                    client_id,
                    entity_id,
                    user_id,
                    scope,
                    expires_at,
                })
            },
        ))
    }

    /// Drop expired codes, token records, and refresh tokens. Run from the
    /// periodic sweep; queue eviction has its own timer.
    pub async fn cleanup_expired_oauth(&self, now: i64) -> Result<u64> {
        let mut removed = 0;
        removed += sqlx::query("DELETE FROM oauth_auth_codes WHERE expires_at <= ?")
            .bind(now)
            .execute(self.pool())
            .await?
            .rows_affected();
        removed += sqlx::query("DELETE FROM oauth_access_tokens WHERE expires_at <= ?")
            .bind(now)
            .execute(self.pool())
            .await?
            .rows_affected();
        removed += sqlx::query("DELETE FROM oauth_refresh_tokens WHERE expires_at <= ?")
            .bind(now)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(removed)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::test_registry};

    fn sample_code(code: &str, expires_at: i64) -> AuthCodeRecord {
        AuthCodeRecord {
            code: code.into(),
            client_id: "client-1".into(),
            entity_id: "entity-1".into(),
            user_id: "user-1".into(),
            redirect_uri: "https://client.example/cb".into(),
            code_challenge: "challenge".into(),
            scope: "mcp".into(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn auth_code_consume_is_destructive() {
        let registry = test_registry().await;
        registry.insert_auth_code(&sample_code("c1", 1_000)).await.unwrap();

        let first = registry.consume_auth_code("c1", 500).await.unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().entity_id, "entity-1");

        // Second consume must return nothing.
        assert!(registry.consume_auth_code("c1", 500).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_auth_code_is_gone() {
        let registry = test_registry().await;
        registry.insert_auth_code(&sample_code("c1", 100)).await.unwrap();
        assert!(registry.consume_auth_code("c1", 200).await.unwrap().is_none());
        // And it was deleted, not left behind.
        assert!(registry.consume_auth_code("c1", 50).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn token_active_until_revoked() {
        let registry = test_registry().await;
        registry
            .record_access_token(&AccessTokenRecord {
                jti: "jti-1".into(),
                entity_id: "entity-1".into(),
                user_id: "user-1".into(),
                client_id: "client-1".into(),
                scope: "mcp".into(),
                expires_at: 10_000,
                revoked: false,
            })
            .await
            .unwrap();

        assert!(registry.is_token_active("jti-1", 5_000).await.unwrap());
        assert!(!registry.is_token_active("jti-1", 20_000).await.unwrap());
        assert!(!registry.is_token_active("unknown", 5_000).await.unwrap());

        registry.revoke_token("jti-1").await.unwrap();
        assert!(!registry.is_token_active("jti-1", 5_000).await.unwrap());
    }

    #[tokio::test]
    async fn refresh_token_is_single_use() {
        let registry = test_registry().await;
        registry
            .insert_refresh_token(&RefreshTokenRecord {
                token: "rt-1".into(),
                jti: "jti-1".into(),
                client_id: "client-1".into(),
                entity_id: "entity-1".into(),
                user_id: "user-1".into(),
                scope: "mcp".into(),
                expires_at: 10_000,
            })
            .await
            .unwrap();

        let record = registry.consume_refresh_token("rt-1", 5_000).await.unwrap();
        assert_eq!(record.unwrap().jti, "jti-1");
        assert!(registry.consume_refresh_token("rt-1", 5_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_removes_expired_artifacts() {
        let registry = test_registry().await;
        registry.insert_auth_code(&sample_code("old", 100)).await.unwrap();
        registry.insert_auth_code(&sample_code("new", 10_000)).await.unwrap();

        let removed = registry.cleanup_expired_oauth(1_000).await.unwrap();
        assert_eq!(removed, 1);
        assert!(registry.consume_auth_code("new", 1_000).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn client_roundtrip() {
        let registry = test_registry().await;
        let client = registry
            .create_oauth_client(
                Some("Claude Desktop"),
                &["https://client.example/cb".to_string()],
                &["authorization_code".to_string(), "refresh_token".to_string()],
                &["code".to_string()],
                "none",
                1_700_000_000,
            )
            .await
            .unwrap();

        let fetched = registry.get_oauth_client(&client.id).await.unwrap().unwrap();
        assert_eq!(fetched.name.as_deref(), Some("Claude Desktop"));
        assert_eq!(fetched.redirect_uris, vec!["https://client.example/cb"]);
        assert_eq!(fetched.token_endpoint_auth_method, "none");
    }
}
