//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: GRAYLOGIC_, nested keys split on `_`,
//!    e.g. `GRAYLOGIC_MQTT_PASSWORD`, `GRAYLOGIC_AUTH_JWT_SECRET`) —
//!    intended for secrets
//! 2. YAML config file (`GRAYLOGIC_CONFIG` or `./graylogic.yaml`)
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Service-level settings
    #[serde(default)]
    pub service: ServiceConfig,

    /// SQLite settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// MQTT broker settings
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// knxd wire-client settings
    #[serde(default)]
    pub knx: KnxConfig,

    /// Managed knxd daemon settings
    #[serde(default)]
    pub knxd: KnxdConfig,

    /// Authentication settings
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name used in client ids and status payloads
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones
    #[serde(default = "default_false")]
    pub log_json: bool,

    /// Data directory for the SQLite file and scratch state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_json: false,
            data_dir: default_data_dir(),
        }
    }
}

/// SQLite configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the database file; `:memory:` for tests
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Bound on the post-connect `SELECT 1` verification
    #[serde(default = "default_connect_verify_secs")]
    pub connect_verify_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            connect_verify_secs: default_connect_verify_secs(),
        }
    }
}

impl DatabaseConfig {
    /// Connect-verify bound as a [`Duration`]
    pub fn connect_verify_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_verify_secs)
    }
}

/// MQTT broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client id presented to the broker
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,

    /// Username; empty disables authentication
    #[serde(default)]
    pub username: String,

    /// Password (set via GRAYLOGIC_MQTT_PASSWORD)
    #[serde(default)]
    pub password: String,

    /// Use TLS (>= 1.2) for the broker connection
    #[serde(default = "default_false")]
    pub tls: bool,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Reconnect delay ceiling in milliseconds
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_mqtt_client_id(),
            username: String::new(),
            password: String::new(),
            tls: false,
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl MqttConfig {
    /// First reconnect delay as a [`Duration`]
    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    /// Reconnect delay ceiling as a [`Duration`]
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// knxd wire-client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnxConfig {
    /// knxd endpoint: `tcp://host:port` or `unix:///path`
    #[serde(default = "default_knxd_url")]
    pub url: String,

    /// Dial + handshake bound in seconds
    #[serde(default = "default_knx_connect_secs")]
    pub connect_timeout_secs: u64,

    /// Per-frame read bound in seconds
    #[serde(default = "default_knx_read_secs")]
    pub read_timeout_secs: u64,
}

impl Default for KnxConfig {
    fn default() -> Self {
        Self {
            url: default_knxd_url(),
            connect_timeout_secs: default_knx_connect_secs(),
            read_timeout_secs: default_knx_read_secs(),
        }
    }
}

impl KnxConfig {
    /// Dial + handshake bound as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-frame read bound as a [`Duration`]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Bus backend for the managed knxd daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum KnxdBackend {
    /// KNX-USB interface stick
    Usb {
        /// USB vendor id, hex without prefix (e.g. "0e77")
        vendor_id: String,
        /// USB product id, hex without prefix (e.g. "0104")
        product_id: String,
    },
    /// KNXnet/IP tunnelling to a remote gateway
    Tunnel {
        host: String,
        #[serde(default = "default_tunnel_port")]
        port: u16,
    },
    /// KNXnet/IP routing on a multicast group
    Routing {
        #[serde(default = "default_routing_multicast")]
        multicast: String,
        interface: String,
    },
}

impl Default for KnxdBackend {
    fn default() -> Self {
        KnxdBackend::Tunnel {
            host: "localhost".to_string(),
            port: default_tunnel_port(),
        }
    }
}

/// Managed knxd daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnxdConfig {
    /// Whether graylogicd supervises a local knxd at all
    #[serde(default = "default_true")]
    pub managed: bool,

    /// Path to the knxd binary
    #[serde(default = "default_knxd_binary")]
    pub binary: String,

    /// Physical address knxd claims on the bus
    #[serde(default = "default_physical_address")]
    pub physical_address: String,

    /// First client address handed to connecting clients
    #[serde(default = "default_client_address_start")]
    pub client_address_start: String,

    /// Number of client addresses in the pool
    #[serde(default = "default_client_address_count")]
    pub client_address_count: u8,

    /// Bus backend
    #[serde(default)]
    pub backend: KnxdBackend,

    /// Enable knxd's group-communication cache
    #[serde(default = "default_false")]
    pub group_cache: bool,

    /// knxd trace mask (0 disables)
    #[serde(default)]
    pub trace_level: u32,

    /// Seconds between health-check rounds
    #[serde(default = "default_health_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Reset the USB interface before every restart attempt
    #[serde(default = "default_false")]
    pub usb_reset_on_retry: bool,

    /// Reset the USB interface when bus probes (layers 3/4) fail
    #[serde(default = "default_false")]
    pub usb_reset_on_bus_failure: bool,

    /// Group address probed for the device-descriptor health check (layer 4)
    #[serde(default)]
    pub descriptor_probe_address: Option<String>,

    /// Group address probed by the fallback group read (layer 3)
    #[serde(default)]
    pub group_probe_address: Option<String>,
}

impl Default for KnxdConfig {
    fn default() -> Self {
        Self {
            managed: true,
            binary: default_knxd_binary(),
            physical_address: default_physical_address(),
            client_address_start: default_client_address_start(),
            client_address_count: default_client_address_count(),
            backend: KnxdBackend::default(),
            group_cache: false,
            trace_level: 0,
            health_check_interval_secs: default_health_interval_secs(),
            usb_reset_on_retry: false,
            usb_reset_on_bus_failure: false,
            descriptor_probe_address: None,
            group_probe_address: None,
        }
    }
}

impl KnxdConfig {
    /// Health-check cadence as a [`Duration`]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret (set via GRAYLOGIC_AUTH_JWT_SECRET)
    #[serde(default)]
    pub jwt_secret: String,

    /// Access-token lifetime in seconds
    #[serde(default = "default_access_ttl_secs")]
    pub access_token_ttl_secs: u64,

    /// Refresh-token lifetime in seconds
    #[serde(default = "default_refresh_ttl_secs")]
    pub refresh_token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_token_ttl_secs: default_access_ttl_secs(),
            refresh_token_ttl_secs: default_refresh_ttl_secs(),
        }
    }
}

impl AuthConfig {
    /// Access-token lifetime as a [`Duration`]
    pub fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.access_token_ttl_secs)
    }

    /// Refresh-token lifetime as a [`Duration`]
    pub fn refresh_token_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_token_ttl_secs)
    }
}

impl Config {
    /// Load configuration from the default file location and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("GRAYLOGIC_CONFIG")
            .unwrap_or_else(|_| "graylogic.yaml".to_string());
        Self::load_from(&path)
    }

    /// Load configuration from an explicit YAML file path
    ///
    /// The file is optional; defaults and environment variables alone
    /// produce a usable development configuration.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            // GRAYLOGIC_<SECTION>_<FIELD>: only the first underscore is a
            // section separator, so GRAYLOGIC_AUTH_JWT_SECRET reaches
            // auth.jwt_secret intact.
            .merge(
                Env::prefixed("GRAYLOGIC_")
                    .map(|key| key.as_str().replacen('_', ".", 1).into()),
            )
            .extract()?;

        Ok(config)
    }

    /// Validate cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            return Err(crate::error::Error::Validation(
                "auth.jwt_secret must be set (GRAYLOGIC_AUTH_JWT_SECRET)".to_string(),
            ));
        }
        if self.mqtt.reconnect_initial_ms == 0
            || self.mqtt.reconnect_max_ms < self.mqtt.reconnect_initial_ms
        {
            return Err(crate::error::Error::Validation(
                "mqtt reconnect delays must satisfy 0 < initial <= max".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_service_name() -> String {
    "graylogic".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/graylogic")
}

fn default_db_path() -> String {
    "/var/lib/graylogic/graylogic.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_connect_verify_secs() -> u64 {
    5
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "graylogic-core".to_string()
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_knxd_url() -> String {
    "tcp://localhost:6720".to_string()
}

fn default_knx_connect_secs() -> u64 {
    10
}

fn default_knx_read_secs() -> u64 {
    30
}

fn default_knxd_binary() -> String {
    "/usr/bin/knxd".to_string()
}

fn default_physical_address() -> String {
    "1.1.128".to_string()
}

fn default_client_address_start() -> String {
    "1.1.129".to_string()
}

fn default_client_address_count() -> u8 {
    8
}

fn default_tunnel_port() -> u16 {
    3671
}

fn default_routing_multicast() -> String {
    "224.0.23.12".to_string()
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_access_ttl_secs() -> u64 {
    15 * 60
}

fn default_refresh_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.knx.connect_timeout_secs, 10);
        assert_eq!(config.knx.read_timeout_secs, 30);
        assert_eq!(config.auth.access_token_ttl_secs, 900);
        assert_eq!(config.knxd.health_check_interval_secs, 30);
    }

    #[test]
    fn test_validate_requires_jwt_secret() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auth.jwt_secret = "test-secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reconnect_delays() {
        let mut config = Config::default();
        config.auth.jwt_secret = "test-secret".to_string();
        config.mqtt.reconnect_max_ms = 100;
        config.mqtt.reconnect_initial_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("GRAYLOGIC_MQTT_HOST", "broker.internal");
            jail.set_env("GRAYLOGIC_AUTH_JWT_SECRET", "from-env");
            let config = Config::load_from("does-not-exist.yaml").expect("load");
            assert_eq!(config.mqtt.host, "broker.internal");
            assert_eq!(config.auth.jwt_secret, "from-env");
            Ok(())
        });
    }

    #[test]
    fn test_yaml_file_load() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "graylogic.yaml",
                r#"
mqtt:
  host: mqtt.lan
  port: 8883
  tls: true
knxd:
  backend:
    kind: usb
    vendor_id: "0e77"
    product_id: "0104"
"#,
            )?;
            let config = Config::load_from("graylogic.yaml").expect("load");
            assert_eq!(config.mqtt.host, "mqtt.lan");
            assert_eq!(config.mqtt.port, 8883);
            assert!(config.mqtt.tls);
            assert!(matches!(config.knxd.backend, KnxdBackend::Usb { .. }));
            Ok(())
        });
    }
}
