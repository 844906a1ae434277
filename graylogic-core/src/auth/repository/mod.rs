//! SQLite repositories for the auth tables
//!
//! All repositories share the single-writer pool. Sentinel errors
//! (`UserNotFound`, `TokenReuse`, ...) surface unchanged so the HTTP layer
//! can pattern-match.

pub mod panels;
pub mod refresh;
pub mod room_access;
pub mod users;

pub use panels::PanelRepository;
pub use refresh::RefreshTokenRepository;
pub use room_access::RoomAccessRepository;
pub use users::UserRepository;
