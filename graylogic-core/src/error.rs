//! Error types shared across the core
//!
//! Every fallible public operation in this crate returns [`Result`]. Callers
//! pattern-match on the stable sentinel variants (`DeviceNotFound`,
//! `TokenReuse`, `NotConnected`, ...) instead of string-sniffing messages;
//! wrapped sources are preserved so `std::error::Error::source` chains hold
//! across repository boundaries.

use thiserror::Error;

/// Result type alias using the core error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the core
#[derive(Debug, Error)]
pub enum Error {
    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------
    /// Operation attempted on a client that is not connected
    #[error("not connected")]
    NotConnected,

    /// Establishing a connection failed (dial, handshake, or first ack)
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// MQTT publish was rejected or timed out
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// MQTT subscribe was rejected or timed out
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    // ------------------------------------------------------------------
    // Protocol
    // ------------------------------------------------------------------
    /// Group address string or components out of range
    #[error("invalid group address: {0}")]
    InvalidGroupAddress(String),

    /// Telegram frame failed to parse or encode
    #[error("invalid telegram: {0}")]
    InvalidTelegram(String),

    /// APCI octet outside the known set
    #[error("invalid APCI: {0:#04x}")]
    InvalidApci(u8),

    /// MQTT QoS outside 0..=2
    #[error("invalid QoS: {0}")]
    InvalidQos(u8),

    /// Empty or malformed MQTT topic
    #[error("invalid topic: {0:?}")]
    InvalidTopic(String),

    /// Payload exceeds the broker or frame maximum
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------
    /// Underlying database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration could not be applied
    #[error("migration {version} failed: {message}")]
    Migration { version: String, message: String },

    /// Device lookup missed
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Slug already taken by another device
    #[error("device already exists: {0}")]
    DeviceExists(String),

    /// User lookup missed
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// Username already taken
    #[error("user already exists: {0}")]
    UserExists(String),

    /// Panel lookup missed
    #[error("panel not found: {0}")]
    PanelNotFound(String),

    // ------------------------------------------------------------------
    // Auth
    // ------------------------------------------------------------------
    /// Username/password pair did not verify
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Presented refresh token is unknown
    #[error("refresh token not found")]
    TokenNotFound,

    /// Presented refresh token is past its expiry
    #[error("refresh token expired")]
    TokenExpired,

    /// Presented refresh token was revoked
    #[error("refresh token revoked")]
    TokenRevoked,

    /// A revoked token was replayed; its whole family has been revoked
    #[error("refresh token reuse detected")]
    TokenReuse,

    /// Principal lacks the required permission
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// JWT encode/decode failure
    #[error("JWT error: {0}")]
    Jwt(Box<jsonwebtoken::errors::Error>),

    /// Password hashing or PHC parsing failure
    #[error("password hash error: {0}")]
    PasswordHash(String),

    // ------------------------------------------------------------------
    // Supervisor
    // ------------------------------------------------------------------
    /// Process supervision failure (spawn, signal, or policy)
    #[error("supervisor error: {0}")]
    Supervisor(String),

    // ------------------------------------------------------------------
    // Validation / config / io
    // ------------------------------------------------------------------
    /// Input rejected at a public entry point; no partial mutation occurred
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for transient transport errors that a reconnect loop may clear
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NotConnected
                | Error::ConnectionFailed(_)
                | Error::PublishFailed(_)
                | Error::SubscribeFailed(_)
        )
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error::Jwt(Box::new(err))
    }
}
