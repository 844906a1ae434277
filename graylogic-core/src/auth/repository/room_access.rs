//! Per-room access grants and scope resolution
//!
//! Admin and owner bypass room scoping entirely; the `user` role and
//! panels act only inside their granted set. A user with no grants
//! resolves to a locked-out scope, which is distinct from unrestricted.

use sqlx::SqlitePool;

use crate::auth::models::{PanelRoomAccess, RoomAccess, User};
use crate::auth::roles::Role;
use crate::auth::scope::RoomScope;
use crate::error::Result;

/// SQLite repository for user and panel room grants
#[derive(Clone)]
pub struct RoomAccessRepository {
    pool: SqlitePool,
}

impl RoomAccessRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Grant (or update) a user's access to one room
    pub async fn grant_user(
        &self,
        user_id: &str,
        room_id: &str,
        can_manage_scenes: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_room_access (user_id, room_id, can_manage_scenes)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (user_id, room_id) DO UPDATE SET can_manage_scenes = ?3
            "#,
        )
        .bind(user_id)
        .bind(room_id)
        .bind(can_manage_scenes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_user(&self, user_id: &str, room_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM user_room_access WHERE user_id = ?1 AND room_id = ?2")
            .bind(user_id)
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn grant_panel(&self, panel_id: &str, room_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO panel_room_access (panel_id, room_id)
            VALUES (?1, ?2)
            ON CONFLICT (panel_id, room_id) DO NOTHING
            "#,
        )
        .bind(panel_id)
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_panel(&self, panel_id: &str, room_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM panel_room_access WHERE panel_id = ?1 AND room_id = ?2")
            .bind(panel_id)
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn user_rooms(&self, user_id: &str) -> Result<Vec<RoomAccess>> {
        let rows: Vec<(String, String, bool)> = sqlx::query_as(
            "SELECT user_id, room_id, can_manage_scenes FROM user_room_access
             WHERE user_id = ?1 ORDER BY room_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, room_id, can_manage_scenes)| RoomAccess {
                user_id,
                room_id,
                can_manage_scenes,
            })
            .collect())
    }

    pub async fn panel_rooms(&self, panel_id: &str) -> Result<Vec<PanelRoomAccess>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT panel_id, room_id FROM panel_room_access
             WHERE panel_id = ?1 ORDER BY room_id",
        )
        .bind(panel_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(panel_id, room_id)| PanelRoomAccess { panel_id, room_id })
            .collect())
    }

    /// Resolve the effective scope for a user; admin/owner bypass
    pub async fn resolve_user_scope(&self, user: &User) -> Result<RoomScope> {
        if matches!(user.role, Role::Admin | Role::Owner) {
            return Ok(RoomScope::unrestricted());
        }

        let grants = self.user_rooms(&user.id).await?;
        let accessible = grants.iter().map(|g| g.room_id.clone());
        let scene_manage = grants
            .iter()
            .filter(|g| g.can_manage_scenes)
            .map(|g| g.room_id.clone());
        Ok(RoomScope::limited(accessible, scene_manage))
    }

    /// Resolve the effective scope for a panel; always explicit grants
    pub async fn resolve_panel_scope(&self, panel_id: &str) -> Result<RoomScope> {
        let grants = self.panel_rooms(panel_id).await?;
        let accessible: Vec<String> = grants.into_iter().map(|g| g.room_id).collect();
        // Panels never manage scenes
        Ok(RoomScope::limited(accessible, std::iter::empty()))
    }
}
