//! The flat MQTT topic grammar
//!
//! Everything lives under `graylogic/`. Bridges publish to
//! `state/{protocol}/{address}` and listen on `command/{protocol}/{address}`;
//! the core mirrors device state at `graylogic/core/device/{id}/state`;
//! presence is retained at `graylogic/system/status`.
//!
//! Address tokens must not contain `/` — a KNX group address is flattened
//! with [`address_token`] before it becomes a topic segment, otherwise the
//! `+` wildcard subscriptions would no longer cover it.

/// Root of the topic tree
pub const BASE: &str = "graylogic";

/// Retained system presence topic
pub const SYSTEM_STATUS: &str = "graylogic/system/status";

/// Flatten a protocol address into a single topic segment
///
/// `"1/0/1"` becomes `"1-0-1"`.
pub fn address_token(address: &str) -> String {
    address.replace('/', "-")
}

/// Bridge-published device state: `graylogic/state/{protocol}/{address}`
pub fn state(protocol: &str, address: &str) -> String {
    format!("{}/state/{}/{}", BASE, protocol, address)
}

/// Inbound device command: `graylogic/command/{protocol}/{address}`
pub fn command(protocol: &str, address: &str) -> String {
    format!("{}/command/{}/{}", BASE, protocol, address)
}

/// Command acknowledgement: `graylogic/ack/{protocol}/{address}`
pub fn ack(protocol: &str, address: &str) -> String {
    format!("{}/ack/{}/{}", BASE, protocol, address)
}

/// Request half of a request/response exchange
pub fn request(protocol: &str, request_id: &str) -> String {
    format!("{}/request/{}/{}", BASE, protocol, request_id)
}

/// Response half of a request/response exchange
pub fn response(protocol: &str, request_id: &str) -> String {
    format!("{}/response/{}/{}", BASE, protocol, request_id)
}

/// Per-protocol bridge health: `graylogic/health/{protocol}`
pub fn health(protocol: &str) -> String {
    format!("{}/health/{}", BASE, protocol)
}

/// Per-protocol discovery announcements: `graylogic/discovery/{protocol}`
pub fn discovery(protocol: &str) -> String {
    format!("{}/discovery/{}", BASE, protocol)
}

/// Canonical core-side state mirror: `graylogic/core/device/{id}/state`
pub fn device_state(device_id: &str) -> String {
    format!("{}/core/device/{}/state", BASE, device_id)
}

/// Wildcard over every bridge state topic
pub fn all_states() -> String {
    format!("{}/state/+/+", BASE)
}

/// Wildcard over every command topic
pub fn all_commands() -> String {
    format!("{}/command/+/+", BASE)
}

/// Wildcard over every ack topic
pub fn all_acks() -> String {
    format!("{}/ack/+/+", BASE)
}

/// Wildcard over every per-protocol health topic
pub fn all_health() -> String {
    format!("{}/health/+", BASE)
}

/// Catch-all over the entire tree
///
/// Hazardous: this sees every retained blob and every state tick on the
/// installation. Meant for diagnostics, not for production subscribers.
pub fn all() -> String {
    format!("{}/#", BASE)
}

/// MQTT filter matching with `+` and `#` wildcards
///
/// `#` must be the final segment; `+` matches exactly one segment.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
