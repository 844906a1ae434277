//! The device model and its validation rules
//!
//! A [`Device`] owns its address and state maps; the registry hands out
//! clones, never references, so callers can mutate what they receive
//! without corrupting the cache. `(protocol, canonical address)` is the
//! routing key used by bridges.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Functional domain a device belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Lighting,
    Climate,
    Blinds,
    Audio,
    Video,
    Security,
    Energy,
    Sensor,
    Plant,
}

impl Domain {
    pub const fn as_str(self) -> &'static str {
        match self {
            Domain::Lighting => "lighting",
            Domain::Climate => "climate",
            Domain::Blinds => "blinds",
            Domain::Audio => "audio",
            Domain::Video => "video",
            Domain::Security => "security",
            Domain::Energy => "energy",
            Domain::Sensor => "sensor",
            Domain::Plant => "plant",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lighting" => Ok(Domain::Lighting),
            "climate" => Ok(Domain::Climate),
            "blinds" => Ok(Domain::Blinds),
            "audio" => Ok(Domain::Audio),
            "video" => Ok(Domain::Video),
            "security" => Ok(Domain::Security),
            "energy" => Ok(Domain::Energy),
            "sensor" => Ok(Domain::Sensor),
            "plant" => Ok(Domain::Plant),
            other => Err(Error::Validation(format!("unknown domain: {}", other))),
        }
    }
}

/// Device reachability as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Online,
    Offline,
    Degraded,
    Unknown,
}

impl HealthStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Online => "online",
            HealthStatus::Offline => "offline",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(HealthStatus::Online),
            "offline" => Ok(HealthStatus::Offline),
            "degraded" => Ok(HealthStatus::Degraded),
            "unknown" => Ok(HealthStatus::Unknown),
            other => Err(Error::Validation(format!("unknown health status: {}", other))),
        }
    }
}

/// Protocols the bridges understand, with their required address keys
pub const KNOWN_PROTOCOLS: &[(&str, &[&str])] = &[
    ("knx", &["group_address"]),
    ("mqtt", &["topic"]),
    ("modbus", &["unit_id", "register"]),
    ("virtual", &[]),
];

/// Capability tags the platform understands
pub const KNOWN_CAPABILITIES: &[&str] = &[
    "on_off",
    "dim",
    "color",
    "color_temperature",
    "temperature_read",
    "temperature_set",
    "humidity_read",
    "position",
    "tilt",
    "volume",
    "mute",
    "playback",
    "scene_trigger",
    "power_read",
    "energy_read",
    "motion",
    "occupancy",
    "contact",
    "lock",
    "alarm",
];

const MAX_NAME_LEN: usize = 100;
const MAX_SLUG_LEN: usize = 50;
const MAX_SETTINGS_KEYS: usize = 50;
const MAX_SETTINGS_DEPTH: usize = 10;

static SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("slug regex"));

/// A controllable entity in the catalogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable UUID
    pub id: String,
    /// URL-safe lowercase identifier, globally unique
    pub slug: String,
    /// Human name
    pub name: String,
    pub room_id: Option<String>,
    pub area_id: Option<String>,
    pub domain: Domain,
    /// Free-form device type tag (e.g. "dimmer", "thermostat")
    pub device_type: String,
    /// Protocol tag; see [`KNOWN_PROTOCOLS`]
    pub protocol: String,
    /// Protocol-specific address; ordered so the canonical form is stable
    pub address: BTreeMap<String, Value>,
    pub capabilities: Vec<String>,
    /// Current state plane, last-writer-wins
    pub state: BTreeMap<String, Value>,
    pub state_updated_at: Option<DateTime<Utc>>,
    pub health: HealthStatus,
    pub health_last_seen: Option<DateTime<Utc>>,
    pub gateway_id: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub settings: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// A minimal valid device; callers fill in the rest
    pub fn new(name: impl Into<String>, domain: Domain, protocol: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            slug: slugify(&name),
            name,
            room_id: None,
            area_id: None,
            domain,
            device_type: String::new(),
            protocol: protocol.into(),
            address: BTreeMap::new(),
            capabilities: Vec::new(),
            state: BTreeMap::new(),
            state_updated_at: None,
            health: HealthStatus::Unknown,
            health_last_seen: None,
            gateway_id: None,
            manufacturer: None,
            model: None,
            firmware: None,
            settings: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Canonical address form used as the routing key with `protocol`
    ///
    /// The address map is ordered, so equal maps always serialise equally.
    pub fn address_canonical(&self) -> String {
        serde_json::to_string(&self.address).unwrap_or_default()
    }

    /// Validate the device against the catalogue rules
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("device name must not be empty".to_string()));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(Error::Validation(format!(
                "device name exceeds {} characters",
                MAX_NAME_LEN
            )));
        }
        if self.slug.len() > MAX_SLUG_LEN || !SLUG_RE.is_match(&self.slug) {
            return Err(Error::Validation(format!("invalid slug: {:?}", self.slug)));
        }

        let required_keys = KNOWN_PROTOCOLS
            .iter()
            .find(|(name, _)| *name == self.protocol)
            .map(|(_, keys)| *keys)
            .ok_or_else(|| {
                Error::Validation(format!("unknown protocol: {}", self.protocol))
            })?;
        for key in required_keys {
            if !self.address.contains_key(*key) {
                return Err(Error::Validation(format!(
                    "protocol {} requires address key {:?}",
                    self.protocol, key
                )));
            }
        }
        if self.protocol == "knx" {
            if let Some(Value::String(ga)) = self.address.get("group_address") {
                ga.parse::<crate::knx::GroupAddress>().map_err(|_| {
                    Error::Validation(format!("invalid KNX group address: {:?}", ga))
                })?;
            } else {
                return Err(Error::Validation(
                    "KNX group_address must be a string".to_string(),
                ));
            }
        }

        for capability in &self.capabilities {
            if !KNOWN_CAPABILITIES.contains(&capability.as_str()) {
                return Err(Error::Validation(format!(
                    "unknown capability: {}",
                    capability
                )));
            }
        }

        if self.settings.len() > MAX_SETTINGS_KEYS {
            return Err(Error::Validation(format!(
                "settings exceed {} keys",
                MAX_SETTINGS_KEYS
            )));
        }
        for value in self.settings.values() {
            if json_depth(value) > MAX_SETTINGS_DEPTH {
                return Err(Error::Validation(format!(
                    "settings nest deeper than {} levels",
                    MAX_SETTINGS_DEPTH
                )));
            }
        }

        Ok(())
    }
}

/// Derive a URL-safe slug from a human name
///
/// Lowercases, maps every non-alphanumeric run to a single `-`, trims, and
/// truncates to the slug limit.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true; // suppress a leading dash

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(MAX_SLUG_LEN);
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

fn json_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        _ => 1,
    }
}
