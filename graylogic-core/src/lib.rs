//! # graylogic-core
//!
//! The on-premises control brain for a Gray Logic building-automation
//! installation. This crate is the bridge substrate the rest of the stack
//! stands on:
//!
//! - **Process supervision**: lifecycle management for external protocol
//!   daemons (knxd) with layered health checks, bounded restarts, and
//!   USB recovery
//! - **KNX wire client**: framed group-telegram codec and an async client
//!   for knxd's TCP/Unix host protocol
//! - **MQTT client**: presence (LWT), guaranteed subscription restoration,
//!   panic-isolated handlers over the internal message bus
//! - **Device registry**: in-memory source of truth for the device
//!   catalogue, multi-index lookups, SQLite write-through
//! - **Auth core**: Argon2id password hashing, HS256 access tokens,
//!   refresh-token families with theft detection, panel identities,
//!   per-room scoping
//!
//! Feature automations (scenes, schedules, voice) and the HTTP surface are
//! collaborators that consume this crate; they are not part of it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use graylogic_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let pool = database::open_pool(&config.database).await?;
//!     database::migrate(&pool).await?;
//!
//!     let registry = DeviceRegistry::new(DeviceRepository::new(pool.clone()));
//!     registry.refresh_cache().await?;
//!
//!     let mqtt = MqttClient::connect(&config.mqtt).await?;
//!     let knx = KnxClient::connect(&config.knx).await?;
//!     knx.set_on_telegram(move |telegram| {
//!         tracing::debug!(%telegram.destination, "telegram received");
//!     });
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod knx;
pub mod mqtt;
pub mod observability;
pub mod registry;
pub mod supervisor;

mod util;

pub mod prelude {
    //! Convenience re-exports for daemon and bridge code

    pub use crate::auth::{
        AccessClaims, AuthService, PanelRepository, PasswordHasher, Permission,
        RefreshTokenRepository, Role, RoomAccessRepository, RoomScope, SessionTokens,
        TokenSigner, UserRepository,
    };
    pub use crate::config::Config;
    pub use crate::database;
    pub use crate::error::{Error, Result};
    pub use crate::knx::{Apci, GroupAddress, KnxClient, Telegram};
    pub use crate::mqtt::{topics, MqttClient};
    pub use crate::observability::init_tracing;
    pub use crate::registry::{Device, DeviceRegistry, DeviceRepository, LocationRepository};
    pub use crate::supervisor::{KnxdController, Supervisor, SupervisorConfig};
}
