//! KNX ↔ MQTT bridge wiring
//!
//! Outbound: every received group telegram is published raw to
//! `graylogic/state/knx/{address}`; when the registry resolves the group
//! address to a device, the device's health flips online and a canonical
//! mirror goes to `graylogic/core/device/{id}/state`. Interpretation of
//! payload bytes (DPT decoding) is a higher-layer concern.
//!
//! Inbound: `graylogic/command/knx/{address}` documents
//! `{"action":"write","data":[...]}` or `{"action":"read"}` become group
//! telegrams on the bus.

use std::sync::Arc;

use graylogic_core::error::Result;
use graylogic_core::knx::{GroupAddress, KnxClient, Telegram};
use graylogic_core::mqtt::{topics, MqttClient};
use graylogic_core::registry::{Device, DeviceRegistry, HealthStatus};

/// Wires a KNX client, an MQTT client, and the registry together
pub struct Bridge {
    registry: Arc<DeviceRegistry>,
    mqtt: MqttClient,
    knx: KnxClient,
}

impl Bridge {
    pub fn new(registry: Arc<DeviceRegistry>, mqtt: MqttClient, knx: KnxClient) -> Self {
        Self {
            registry,
            mqtt,
            knx,
        }
    }

    /// Install both directions of the bridge
    pub async fn start(&self) -> Result<()> {
        let mqtt = self.mqtt.clone();
        let registry = self.registry.clone();
        self.knx.set_on_telegram(move |telegram| {
            let mqtt = mqtt.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                publish_telegram(&mqtt, &registry, telegram).await;
            });
        });

        let knx = self.knx.clone();
        self.mqtt
            .subscribe(&topics::all_commands(), 1, move |topic, payload| {
                let knx = knx.clone();
                let topic = topic.to_string();
                let payload = payload.to_vec();
                tokio::spawn(async move {
                    handle_command(&knx, &topic, &payload).await;
                });
            })
            .await?;

        tracing::info!("knx/mqtt bridge active");
        Ok(())
    }
}

async fn publish_telegram(mqtt: &MqttClient, registry: &Arc<DeviceRegistry>, telegram: Telegram) {
    let address = telegram.destination.to_string();
    let document = serde_json::json!({
        "address": address,
        "apci": telegram.apci.to_string(),
        "data": telegram.payload,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let payload = match serde_json::to_vec(&document) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, "telegram document encode failed");
            return;
        }
    };

    let topic = topics::state("knx", &topics::address_token(&address));
    if let Err(e) = mqtt.publish(&topic, &payload, 0, false).await {
        tracing::warn!(topic = %topic, error = %e, "state publish failed");
    }

    // Canonical per-device mirror when the address routes to a device
    if let Some(device) = resolve_device(registry, &address).await {
        if device.health != HealthStatus::Online {
            if let Err(e) = registry
                .set_device_health(&device.id, HealthStatus::Online)
                .await
            {
                tracing::warn!(device = %device.id, error = %e, "health update failed");
            }
        }
        let mirror = topics::device_state(&device.id);
        if let Err(e) = mqtt.publish(&mirror, &payload, 0, true).await {
            tracing::warn!(topic = %mirror, error = %e, "device mirror publish failed");
        }
    }
}

async fn resolve_device(registry: &Arc<DeviceRegistry>, group_address: &str) -> Option<Device> {
    registry
        .get_devices_by_protocol("knx")
        .await
        .into_iter()
        .find(|device| {
            device
                .address
                .get("group_address")
                .and_then(|v| v.as_str())
                .is_some_and(|ga| ga == group_address)
        })
}

async fn handle_command(knx: &KnxClient, topic: &str, payload: &[u8]) {
    // graylogic/command/{protocol}/{address}
    let mut parts = topic.split('/');
    let (Some("graylogic"), Some("command"), Some(protocol), Some(token)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return;
    };
    if protocol != "knx" {
        return;
    }

    let address = token.replace('-', "/");
    let destination: GroupAddress = match address.parse() {
        Ok(destination) => destination,
        Err(e) => {
            tracing::warn!(topic = %topic, error = %e, "command address unparseable");
            return;
        }
    };

    let document: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(document) => document,
        Err(e) => {
            tracing::warn!(topic = %topic, error = %e, "command payload unparseable");
            return;
        }
    };

    let outcome = match document.get("action").and_then(|a| a.as_str()) {
        Some("read") => knx.send_read(destination).await,
        Some("write") => {
            let empty = Vec::new();
            let items = document
                .get("data")
                .and_then(|d| d.as_array())
                .unwrap_or(&empty);
            let mut data = Vec::with_capacity(items.len());
            for item in items {
                match item.as_u64() {
                    Some(value) if value <= u64::from(u8::MAX) => data.push(value as u8),
                    _ => {
                        tracing::warn!(
                            topic = %topic,
                            value = %item,
                            "write data byte outside 0..=255, command dropped"
                        );
                        return;
                    }
                }
            }
            knx.send(destination, data).await
        }
        other => {
            tracing::warn!(topic = %topic, action = ?other, "unknown command action");
            return;
        }
    };

    if let Err(e) = outcome {
        tracing::warn!(destination = %destination, error = %e, "command send failed");
    }
}
