//! Panel device identities
//!
//! A panel authenticates with a single bearer token; the row stores only
//! the SHA-256 of it. Token rotation for panels is a higher-layer policy
//! and not modelled here.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::auth::models::Panel;
use crate::auth::repository::users::{is_unique_violation, parse_instant};
use crate::error::{Error, Result};

/// SQLite repository for panels
#[derive(Clone)]
pub struct PanelRepository {
    pool: SqlitePool,
}

impl PanelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, panel: &Panel) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO panels (id, name, token_hash, active, last_seen_at, created_by, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&panel.id)
        .bind(&panel.name)
        .bind(&panel.token_hash)
        .bind(panel.active)
        .bind(panel.last_seen_at.map(|t| t.to_rfc3339()))
        .bind(&panel.created_by)
        .bind(panel.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::Validation(
                "panel token hash already registered".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Panel> {
        let row = sqlx::query("SELECT * FROM panels WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_panel(&r))
            .transpose()?
            .ok_or_else(|| Error::PanelNotFound(id.to_string()))
    }

    /// Resolve a presented bearer token to an active panel identity
    pub async fn authenticate(&self, token_hash: &str) -> Result<Panel> {
        let row = sqlx::query("SELECT * FROM panels WHERE token_hash = ?1 AND active = 1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_panel(&r))
            .transpose()?
            .ok_or(Error::InvalidCredentials)
    }

    pub async fn touch_last_seen(&self, id: &str) -> Result<()> {
        let done = sqlx::query("UPDATE panels SET last_seen_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::PanelNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let done = sqlx::query("UPDATE panels SET active = ?2 WHERE id = ?1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::PanelNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Panel>> {
        let rows = sqlx::query("SELECT * FROM panels ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_panel).collect()
    }

    /// Delete a panel; its room grants cascade
    pub async fn delete(&self, id: &str) -> Result<()> {
        let done = sqlx::query("DELETE FROM panels WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::PanelNotFound(id.to_string()));
        }
        Ok(())
    }
}

fn row_to_panel(row: &SqliteRow) -> Result<Panel> {
    let last_seen_at: Option<String> = row.try_get("last_seen_at")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Panel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        token_hash: row.try_get("token_hash")?,
        active: row.try_get("active")?,
        last_seen_at: last_seen_at.map(|t| parse_instant(&t)),
        created_by: row.try_get("created_by")?,
        created_at: parse_instant(&created_at),
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::sample_panel;
    use super::*;
    use crate::auth::tokens::hash_token;
    use crate::database::test_support::test_pool;

    #[tokio::test]
    async fn test_bearer_token_auth() {
        let (pool, _dir) = test_pool().await;
        let repo = PanelRepository::new(pool);

        let panel = sample_panel("Kitchen Panel", "raw-bearer-token");
        repo.create(&panel).await.expect("create");

        let found = repo
            .authenticate(&hash_token("raw-bearer-token"))
            .await
            .expect("authenticate");
        assert_eq!(found.id, panel.id);

        assert!(matches!(
            repo.authenticate(&hash_token("wrong-token")).await,
            Err(Error::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_inactive_panel_rejected() {
        let (pool, _dir) = test_pool().await;
        let repo = PanelRepository::new(pool);

        let panel = sample_panel("Kitchen Panel", "raw-token");
        repo.create(&panel).await.expect("create");
        repo.set_active(&panel.id, false).await.expect("deactivate");

        assert!(matches!(
            repo.authenticate(&hash_token("raw-token")).await,
            Err(Error::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_touch_last_seen() {
        let (pool, _dir) = test_pool().await;
        let repo = PanelRepository::new(pool);

        let panel = sample_panel("Hall Panel", "tok");
        repo.create(&panel).await.expect("create");
        assert!(repo.get(&panel.id).await.unwrap().last_seen_at.is_none());

        repo.touch_last_seen(&panel.id).await.expect("touch");
        assert!(repo.get(&panel.id).await.unwrap().last_seen_at.is_some());

        assert!(matches!(
            repo.touch_last_seen("pnl-missing").await,
            Err(Error::PanelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_token_hash_rejected() {
        let (pool, _dir) = test_pool().await;
        let repo = PanelRepository::new(pool);

        repo.create(&sample_panel("One", "same-token")).await.unwrap();
        let result = repo.create(&sample_panel("Two", "same-token")).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_delete() {
        let (pool, _dir) = test_pool().await;
        let repo = PanelRepository::new(pool);

        let panel = sample_panel("Hall Panel", "tok");
        repo.create(&panel).await.unwrap();
        repo.delete(&panel.id).await.expect("delete");
        assert!(matches!(
            repo.get(&panel.id).await,
            Err(Error::PanelNotFound(_))
        ));
    }
}
