//! Refresh-token storage, rotation, and theft detection
//!
//! Rotation is one SQLite transaction: the consumed token is revoked and
//! its successor inserted with the same family id. Presenting an
//! already-revoked token is never ambiguous — either it was consumed
//! legitimately (its successor exists) or it was stolen after rotation —
//! so the whole family is revoked and [`Error::TokenReuse`] surfaces for
//! the HTTP layer to force re-authentication.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::auth::models::RefreshToken;
use crate::auth::repository::users::parse_instant;
use crate::auth::tokens::new_refresh_token_id;
use crate::error::{Error, Result};

/// SQLite repository for refresh tokens
#[derive(Clone)]
pub struct RefreshTokenRepository {
    pool: SqlitePool,
}

impl RefreshTokenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a freshly issued token
    pub async fn store(&self, token: &RefreshToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (
                id, user_id, family_id, token_hash, device_label,
                expires_at, revoked, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&token.id)
        .bind(&token.user_id)
        .bind(&token.family_id)
        .bind(&token.token_hash)
        .bind(&token.device_label)
        .bind(token.expires_at.to_rfc3339())
        .bind(token.revoked)
        .bind(token.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        let row = sqlx::query("SELECT * FROM refresh_tokens WHERE token_hash = ?1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_token(&r)).transpose()
    }

    pub async fn get(&self, id: &str) -> Result<Option<RefreshToken>> {
        let row = sqlx::query("SELECT * FROM refresh_tokens WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_token(&r)).transpose()
    }

    /// Rotate the family forward one token, atomically
    ///
    /// The presented token must exist, be unrevoked, and be unexpired.
    /// A revoked presentation revokes the entire family and returns
    /// [`Error::TokenReuse`].
    pub async fn rotate(
        &self,
        presented_hash: &str,
        successor_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<RefreshToken> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM refresh_tokens WHERE token_hash = ?1")
            .bind(presented_hash)
            .fetch_optional(&mut *tx)
            .await?;
        let presented = match row {
            Some(row) => row_to_token(&row)?,
            None => return Err(Error::TokenNotFound),
        };

        if presented.revoked {
            // Theft or replay; the transaction drops (rollback) and the
            // family dies outside it.
            drop(tx);
            let revoked = self.revoke_family(&presented.family_id).await?;
            tracing::warn!(
                family_id = %presented.family_id,
                tokens_revoked = revoked,
                "revoked refresh token replayed; family revoked"
            );
            return Err(Error::TokenReuse);
        }
        if presented.is_expired() {
            return Err(Error::TokenExpired);
        }

        sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE id = ?1")
            .bind(&presented.id)
            .execute(&mut *tx)
            .await?;

        let successor = RefreshToken {
            id: new_refresh_token_id(),
            user_id: presented.user_id.clone(),
            family_id: presented.family_id.clone(),
            token_hash: successor_hash.to_string(),
            device_label: presented.device_label.clone(),
            expires_at,
            revoked: false,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (
                id, user_id, family_id, token_hash, device_label,
                expires_at, revoked, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
            "#,
        )
        .bind(&successor.id)
        .bind(&successor.user_id)
        .bind(&successor.family_id)
        .bind(&successor.token_hash)
        .bind(&successor.device_label)
        .bind(successor.expires_at.to_rfc3339())
        .bind(successor.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(successor)
    }

    pub async fn revoke(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Revoke every token in a rotation chain; returns the count touched
    pub async fn revoke_family(&self, family_id: &str) -> Result<u64> {
        let done = sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE family_id = ?1")
            .bind(family_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    pub async fn revoke_all_for_user(&self, user_id: &str) -> Result<u64> {
        let done = sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    /// Delete rows past their expiry; run periodically
    pub async fn purge_expired(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= ?1")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<RefreshToken>> {
        let rows = sqlx::query(
            "SELECT * FROM refresh_tokens WHERE user_id = ?1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_token).collect()
    }
}

fn row_to_token(row: &SqliteRow) -> Result<RefreshToken> {
    let expires_at: String = row.try_get("expires_at")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(RefreshToken {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        family_id: row.try_get("family_id")?,
        token_hash: row.try_get("token_hash")?,
        device_label: row.try_get("device_label")?,
        expires_at: parse_instant(&expires_at),
        revoked: row.try_get("revoked")?,
        created_at: parse_instant(&created_at),
    })
}
