//! MQTT client for the internal message bus
//!
//! [`MqttClient`] wraps `rumqttc` behind a narrow surface: presence via a
//! retained Last Will, a subscription registry that is the ground truth for
//! restoration after reconnects, bounded publish/subscribe, and panic
//! isolation around every user handler. [`topics`] holds the flat topic
//! grammar.

pub mod client;
pub mod topics;

pub use client::{MessageHandler, MqttClient};
