//! Authentication and authorization core
//!
//! Credential primitives (Argon2id password hashing, HS256 access tokens,
//! SHA-256-hashed refresh tokens), the static role-permission table,
//! per-room scoping, the SQLite-backed identity repositories, and the
//! first-start owner bootstrap.
//!
//! Refresh tokens rotate in families: each rotation revokes the consumed
//! token and issues its successor under the same family id, so a replayed
//! token is provably either stale or stolen — and either way the family
//! dies.

pub mod models;
pub mod password;
pub mod repository;
pub mod roles;
pub mod scope;
pub mod seed;
pub mod service;
pub mod tokens;

pub use models::{Panel, PanelRoomAccess, RefreshToken, RoomAccess, User};
pub use password::PasswordHasher;
pub use repository::{
    PanelRepository, RefreshTokenRepository, RoomAccessRepository, UserRepository,
};
pub use service::{AuthService, SessionTokens};
pub use roles::{panel_has_permission, role_has_permission, Permission, Role};
pub use scope::RoomScope;
pub use seed::seed_owner;
pub use tokens::{
    hash_token, new_family_id, new_panel_id, new_refresh_token, new_refresh_token_id,
    new_session_id, new_user_id, AccessClaims, TokenSigner, DEFAULT_ACCESS_TTL,
};
