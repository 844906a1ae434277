//! The login / refresh / bearer flow over the auth repositories
//!
//! This is the surface the north-bound HTTP layer calls: credential
//! verification, session issue, refresh-token rotation with theft
//! detection, panel bearer auth, and room-scope resolution. Everything
//! below it (hashing, signing, storage) lives in the sibling modules.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::auth::models::{Panel, RefreshToken, User};
use crate::auth::password::PasswordHasher;
use crate::auth::repository::{
    PanelRepository, RefreshTokenRepository, RoomAccessRepository, UserRepository,
};
use crate::auth::roles::{panel_has_permission, role_has_permission, Permission};
use crate::auth::scope::RoomScope;
use crate::auth::tokens::{
    hash_token, new_family_id, new_refresh_token, new_refresh_token_id, new_session_id,
    AccessClaims, TokenSigner,
};
use crate::config::AuthConfig;
use crate::error::{Error, Result};

/// Tokens handed to a client after login or refresh
#[derive(Debug, Clone)]
pub struct SessionTokens {
    /// Short-lived HS256 JWT
    pub access_token: String,
    /// Raw refresh token; shown to the client once, stored only hashed
    pub refresh_token: String,
    /// Session id carried in the access token's `sid` claim
    pub session_id: String,
}

/// Coordinates the repositories and credential primitives
#[derive(Clone)]
pub struct AuthService {
    users: UserRepository,
    tokens: RefreshTokenRepository,
    panels: PanelRepository,
    room_access: RoomAccessRepository,
    hasher: PasswordHasher,
    signer: TokenSigner,
    refresh_ttl: Duration,
}

impl AuthService {
    pub fn new(pool: SqlitePool, config: &AuthConfig) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            tokens: RefreshTokenRepository::new(pool.clone()),
            panels: PanelRepository::new(pool.clone()),
            room_access: RoomAccessRepository::new(pool),
            hasher: PasswordHasher::new(),
            signer: TokenSigner::new(
                config.jwt_secret.as_bytes(),
                config.access_token_ttl(),
            ),
            refresh_ttl: config.refresh_token_ttl(),
        }
    }

    pub fn users(&self) -> &UserRepository {
        &self.users
    }

    pub fn tokens(&self) -> &RefreshTokenRepository {
        &self.tokens
    }

    pub fn panels(&self) -> &PanelRepository {
        &self.panels
    }

    pub fn room_access(&self) -> &RoomAccessRepository {
        &self.room_access
    }

    pub fn hasher(&self) -> &PasswordHasher {
        &self.hasher
    }

    /// Verify credentials and open a session
    ///
    /// Wrong username and wrong password are indistinguishable to the
    /// caller; both surface [`Error::InvalidCredentials`].
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        device_label: Option<&str>,
    ) -> Result<(User, SessionTokens)> {
        let user = match self.users.get_by_username(username).await {
            Ok(user) => user,
            Err(Error::UserNotFound(_)) => return Err(Error::InvalidCredentials),
            Err(e) => return Err(e),
        };
        if !user.active {
            return Err(Error::InvalidCredentials);
        }
        if !self.hasher.verify(password, &user.password_hash)? {
            return Err(Error::InvalidCredentials);
        }

        let session_id = new_session_id();
        let raw_refresh = new_refresh_token();
        let record = RefreshToken {
            id: new_refresh_token_id(),
            user_id: user.id.clone(),
            family_id: new_family_id(),
            token_hash: hash_token(&raw_refresh),
            device_label: device_label.map(str::to_string),
            expires_at: Utc::now() + chrono::Duration::from_std(self.refresh_ttl).unwrap_or_default(),
            revoked: false,
            created_at: Utc::now(),
        };
        self.tokens.store(&record).await?;

        let access_token = self.signer.generate(&user.id, user.role, &session_id)?;

        tracing::info!(user_id = %user.id, username = %user.username, "login");
        Ok((
            user,
            SessionTokens {
                access_token,
                refresh_token: raw_refresh,
                session_id,
            },
        ))
    }

    /// Rotate a presented refresh token and mint a fresh access token
    ///
    /// A replayed (already-revoked) token kills its whole family and
    /// surfaces [`Error::TokenReuse`]; the client must re-authenticate.
    pub async fn refresh(&self, presented: &str) -> Result<(User, SessionTokens)> {
        let raw_successor = new_refresh_token();
        let successor = self
            .tokens
            .rotate(
                &hash_token(presented),
                &hash_token(&raw_successor),
                Utc::now() + chrono::Duration::from_std(self.refresh_ttl).unwrap_or_default(),
            )
            .await?;

        let user = self.users.get(&successor.user_id).await?;
        if !user.active {
            self.tokens.revoke_family(&successor.family_id).await?;
            return Err(Error::InvalidCredentials);
        }

        let session_id = new_session_id();
        let access_token = self.signer.generate(&user.id, user.role, &session_id)?;

        Ok((
            user,
            SessionTokens {
                access_token,
                refresh_token: raw_successor,
                session_id,
            },
        ))
    }

    /// Invalidate the session a refresh token belongs to
    pub async fn logout(&self, presented: &str) -> Result<()> {
        if let Some(token) = self.tokens.get_by_hash(&hash_token(presented)).await? {
            self.tokens.revoke_family(&token.family_id).await?;
        }
        Ok(())
    }

    /// Validate an access token and load its user
    pub async fn authenticate_access(&self, token: &str) -> Result<(AccessClaims, User)> {
        let claims = self.signer.parse(token)?;
        let user = self.users.get(&claims.sub).await?;
        if !user.active {
            return Err(Error::InvalidCredentials);
        }
        Ok((claims, user))
    }

    /// Validate a panel bearer token and resolve its room scope
    pub async fn authenticate_panel(&self, bearer: &str) -> Result<(Panel, RoomScope)> {
        let panel = self.panels.authenticate(&hash_token(bearer)).await?;
        self.panels.touch_last_seen(&panel.id).await?;
        let scope = self.room_access.resolve_panel_scope(&panel.id).await?;
        Ok((panel, scope))
    }

    /// Resolve the effective room scope for a user
    pub async fn resolve_scope(&self, user: &User) -> Result<RoomScope> {
        self.room_access.resolve_user_scope(user).await
    }

    /// Gate a user action on the static permission table
    pub fn authorize(&self, user: &User, permission: Permission) -> Result<()> {
        if role_has_permission(user.role, permission) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "role {} lacks {}",
                user.role, permission
            )))
        }
    }

    /// Gate a panel action on the panel permission set
    pub fn authorize_panel(&self, permission: Permission) -> Result<()> {
        if panel_has_permission(permission) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("panels lack {}", permission)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::roles::Role;
    use crate::auth::seed::seed_owner;
    use crate::auth::tokens::{new_panel_id, new_user_id};
    use crate::database::test_support::test_pool;

    async fn service() -> (AuthService, tempfile::TempDir) {
        let (pool, dir) = test_pool().await;
        let config = AuthConfig {
            jwt_secret: "unit-test-secret".to_string(),
            ..Default::default()
        };
        (AuthService::new(pool, &config), dir)
    }

    async fn add_user(service: &AuthService, username: &str, password: &str, role: Role) -> User {
        let now = Utc::now();
        let user = User {
            id: new_user_id(),
            username: username.to_string(),
            display_name: username.to_string(),
            email: None,
            password_hash: service.hasher().hash(password).unwrap(),
            role,
            active: true,
            created_by: None,
            created_at: now,
            updated_at: now,
        };
        service.users().create(&user).await.unwrap();
        user
    }

    #[tokio::test]
    async fn test_login_and_access_round_trip() {
        let (service, _dir) = service().await;
        add_user(&service, "alice", "s3cret-enough", Role::Admin).await;

        let (user, session) = service
            .login("alice", "s3cret-enough", Some("laptop"))
            .await
            .expect("login");
        assert_eq!(user.username, "alice");
        assert_eq!(session.refresh_token.len(), 64);

        let (claims, loaded) = service
            .authenticate_access(&session.access_token)
            .await
            .expect("access auth");
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.role, Role::Admin);
        assert_eq!(claims.sid, session.session_id);
        assert_eq!(loaded.id, user.id);
    }

    #[tokio::test]
    async fn test_login_failures_are_uniform() {
        let (service, _dir) = service().await;
        add_user(&service, "alice", "s3cret-enough", Role::User).await;

        assert!(matches!(
            service.login("alice", "wrong", None).await,
            Err(Error::InvalidCredentials)
        ));
        assert!(matches!(
            service.login("nobody", "whatever", None).await,
            Err(Error::InvalidCredentials)
        ));

        // Deactivated accounts fail the same way
        let mut user = service.users().get_by_username("alice").await.unwrap();
        user.active = false;
        service.users().update(&user).await.unwrap();
        assert!(matches!(
            service.login("alice", "s3cret-enough", None).await,
            Err(Error::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_detects_reuse() {
        let (service, _dir) = service().await;
        add_user(&service, "alice", "s3cret-enough", Role::User).await;

        let (_, first) = service.login("alice", "s3cret-enough", None).await.unwrap();
        let (_, second) = service.refresh(&first.refresh_token).await.expect("refresh");
        assert_ne!(first.refresh_token, second.refresh_token);

        // Replaying the consumed token kills the family
        assert!(matches!(
            service.refresh(&first.refresh_token).await,
            Err(Error::TokenReuse)
        ));
        // ... including its freshly issued successor
        assert!(matches!(
            service.refresh(&second.refresh_token).await,
            Err(Error::TokenRevoked) | Err(Error::TokenReuse)
        ));
    }

    #[tokio::test]
    async fn test_logout_revokes_family() {
        let (service, _dir) = service().await;
        add_user(&service, "alice", "s3cret-enough", Role::User).await;

        let (_, session) = service.login("alice", "s3cret-enough", None).await.unwrap();
        service.logout(&session.refresh_token).await.expect("logout");

        assert!(matches!(
            service.refresh(&session.refresh_token).await,
            Err(Error::TokenReuse)
        ));
    }

    #[tokio::test]
    async fn test_seeded_owner_can_log_in() {
        let (service, _dir) = service().await;
        let password = seed_owner(service.users(), service.hasher())
            .await
            .unwrap()
            .expect("seeded");

        let (owner, _) = service.login("owner", &password, None).await.expect("login");
        assert_eq!(owner.role, Role::Owner);
        service
            .authorize(&owner, Permission::SystemDangerous)
            .expect("owner may");
    }

    #[tokio::test]
    async fn test_panel_bearer_flow() {
        let (service, _dir) = service().await;

        let panel = Panel {
            id: new_panel_id(),
            name: "Kitchen Panel".to_string(),
            token_hash: hash_token("panel-bearer"),
            active: true,
            last_seen_at: None,
            created_by: None,
            created_at: Utc::now(),
        };
        service.panels().create(&panel).await.unwrap();
        service
            .room_access()
            .grant_panel(&panel.id, "kitchen")
            .await
            .unwrap();

        let (authed, scope) = service
            .authenticate_panel("panel-bearer")
            .await
            .expect("panel auth");
        assert_eq!(authed.id, panel.id);
        assert!(scope.can_access_room("kitchen"));
        assert!(!scope.can_access_room("cellar"));
        assert!(service
            .panels()
            .get(&panel.id)
            .await
            .unwrap()
            .last_seen_at
            .is_some());

        assert!(matches!(
            service.authenticate_panel("wrong-bearer").await,
            Err(Error::InvalidCredentials)
        ));

        service.authorize_panel(Permission::DeviceOperate).expect("may");
        assert!(service.authorize_panel(Permission::SceneManage).is_err());
    }

    #[tokio::test]
    async fn test_authorize_matrix() {
        let (service, _dir) = service().await;
        let user = add_user(&service, "plain", "s3cret-enough", Role::User).await;
        let admin = add_user(&service, "boss", "s3cret-enough", Role::Admin).await;

        service.authorize(&user, Permission::DeviceOperate).unwrap();
        assert!(service.authorize(&user, Permission::UserManage).is_err());
        service.authorize(&admin, Permission::UserManage).unwrap();
        assert!(service
            .authorize(&admin, Permission::SystemDangerous)
            .is_err());
    }
}
