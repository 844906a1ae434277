//! Identity records backed by the auth tables

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::roles::Role;

/// A human account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// `usr-<uuid-prefix>`
    pub id: String,
    /// Unique, `[A-Za-z0-9._-]{1,64}`
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    /// Argon2id PHC string; never the raw password
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub active: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One link in a refresh-token rotation chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshToken {
    /// `rt-<uuid-prefix>`
    pub id: String,
    pub user_id: String,
    /// Shared by every token descended from one authentication event
    pub family_id: String,
    /// SHA-256 hex of the raw token; the raw value is never persisted
    pub token_hash: String,
    pub device_label: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

impl RefreshToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// A wall-mounted panel identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    /// `pnl-<uuid-prefix>`
    pub id: String,
    pub name: String,
    /// SHA-256 hex of the bearer token
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub active: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A user's grant on one room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAccess {
    pub user_id: String,
    pub room_id: String,
    pub can_manage_scenes: bool,
}

/// A panel's grant on one room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelRoomAccess {
    pub panel_id: String,
    pub room_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_token_expiry() {
        let mut token = RefreshToken {
            id: "rt-1".to_string(),
            user_id: "usr-1".to_string(),
            family_id: "fam-1".to_string(),
            token_hash: "hash".to_string(),
            device_label: None,
            expires_at: Utc::now() + chrono::Duration::hours(1),
            revoked: false,
            created_at: Utc::now(),
        };
        assert!(!token.is_expired());

        token.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(token.is_expired());
    }

    #[test]
    fn test_password_hash_not_serialized() {
        let user = User {
            id: "usr-1".to_string(),
            username: "alice".to_string(),
            display_name: "Alice".to_string(),
            email: None,
            password_hash: "$argon2id$secret".to_string(),
            role: Role::User,
            active: true,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("argon2id"));
        assert!(json.contains("alice"));
    }
}
