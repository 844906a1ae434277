//! rumqttc-backed MQTT client
//!
//! Presence contract: connecting installs a retained Last Will of
//! `{"status":"offline","reason":"unexpected_disconnect",...}` on
//! `graylogic/system/status`; a successful (re)connect publishes a retained
//! `"online"` document; a graceful [`MqttClient::close`] publishes
//! `"graceful_shutdown"` *before* disconnecting, so downstream alerting can
//! tell a crash from an orderly exit.
//!
//! Reconnect contract: the subscription registry — not the broker session —
//! is the ground truth. On every ConnAck the driver re-subscribes every
//! recorded topic, so subscriptions registered while the link was down are
//! restored too.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, Transport};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::error::{Error, Result};
use crate::mqtt::topics;
use crate::util::panic_message;

/// Broker payload ceiling
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const OP_TIMEOUT: Duration = Duration::from_secs(5);
const QUIESCE: Duration = Duration::from_secs(1);

/// Callback invoked for every message on a matching subscription
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Lifecycle callback (connect / disconnect)
pub type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;

struct Subscription {
    qos: QoS,
    handler: MessageHandler,
}

struct Inner {
    client: AsyncClient,
    client_id: String,
    connected: AtomicBool,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    on_connect: RwLock<Option<LifecycleHandler>>,
    on_disconnect: RwLock<Option<LifecycleHandler>>,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn status_payload(&self, status: &str, reason: Option<&str>) -> Vec<u8> {
        let mut doc = serde_json::json!({
            "status": status,
            "client_id": self.client_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(reason) = reason {
            doc["reason"] = serde_json::Value::String(reason.to_string());
        }
        serde_json::to_vec(&doc).unwrap_or_default()
    }

    async fn publish_status(&self, status: &str, reason: Option<&str>) {
        let payload = self.status_payload(status, reason);
        if let Err(e) = self
            .client
            .publish(topics::SYSTEM_STATUS, QoS::AtLeastOnce, true, payload)
            .await
        {
            tracing::warn!(error = %e, status, "status publish failed");
        }
    }

    /// Re-subscribe every recorded topic after a (re)connect
    async fn restore_subscriptions(&self) {
        let recorded: Vec<(String, QoS)> = {
            let map = self.subscriptions.read().expect("subscription lock poisoned");
            map.iter().map(|(t, s)| (t.clone(), s.qos)).collect()
        };

        for (topic, qos) in recorded {
            match self.client.subscribe(topic.clone(), qos).await {
                Ok(()) => tracing::debug!(topic = %topic, "subscription restored"),
                Err(e) => tracing::error!(topic = %topic, error = %e, "subscription restore failed"),
            }
        }
    }

    /// Hand an incoming publish to every matching handler, panic-isolated
    fn dispatch(self: &Arc<Self>, topic: &str, payload: &[u8]) {
        let handlers: Vec<MessageHandler> = {
            let map = self.subscriptions.read().expect("subscription lock poisoned");
            map.iter()
                .filter(|(filter, _)| topics::matches(filter, topic))
                .map(|(_, sub)| sub.handler.clone())
                .collect()
        };

        for handler in handlers {
            let topic = topic.to_string();
            let payload = payload.to_vec();
            tokio::spawn(async move {
                if let Err(p) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    handler(&topic, &payload)
                })) {
                    tracing::error!(
                        topic = %topic,
                        panic = %panic_message(p),
                        "message handler panicked"
                    );
                }
            });
        }
    }

    fn run_lifecycle(&self, slot: &RwLock<Option<LifecycleHandler>>, which: &'static str) {
        let handler = slot.read().expect("lifecycle lock poisoned").clone();
        if let Some(handler) = handler {
            if let Err(p) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler())) {
                tracing::error!(callback = which, panic = %panic_message(p), "lifecycle callback panicked");
            }
        }
    }
}

/// Thread-safe MQTT client; cheap to clone
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<Inner>,
}

impl MqttClient {
    /// Connect to the broker and wait for the first acknowledgement
    ///
    /// The connected flag is set before the retained online status goes out
    /// so a caller publishing immediately after `connect` returns does not
    /// race the asynchronous ConnAck handling.
    pub async fn connect(config: &MqttConfig) -> Result<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PAYLOAD_SIZE + 1024, MAX_PAYLOAD_SIZE + 1024);

        if config.tls {
            // rustls default config negotiates TLS >= 1.2
            options.set_transport(Transport::tls_with_default_config());
        }
        if !config.username.is_empty() {
            options.set_credentials(&config.username, &config.password);
        }

        let lwt_payload = serde_json::to_vec(&serde_json::json!({
            "status": "offline",
            "reason": "unexpected_disconnect",
            "client_id": config.client_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .unwrap_or_default();
        options.set_last_will(LastWill::new(
            topics::SYSTEM_STATUS,
            lwt_payload,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, event_loop) = AsyncClient::new(options, 64);

        let inner = Arc::new(Inner {
            client,
            client_id: config.client_id.clone(),
            connected: AtomicBool::new(false),
            subscriptions: RwLock::new(HashMap::new()),
            on_connect: RwLock::new(None),
            on_disconnect: RwLock::new(None),
            shutdown: CancellationToken::new(),
            driver: Mutex::new(None),
        });

        let (ready_tx, mut ready_rx) = watch::channel(false);
        let handle = tokio::spawn(drive(
            inner.clone(),
            event_loop,
            config.reconnect_initial_delay(),
            config.reconnect_max_delay(),
            ready_tx,
        ));
        *inner.driver.lock().await = Some(handle);

        let first_ack = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                if *ready_rx.borrow() {
                    return true;
                }
                if ready_rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        match first_ack {
            Ok(true) => {}
            _ => {
                inner.shutdown.cancel();
                if let Some(handle) = inner.driver.lock().await.take() {
                    handle.abort();
                }
                return Err(Error::ConnectionFailed(format!(
                    "no ConnAck from {}:{} within {:?}",
                    config.host, config.port, CONNECT_TIMEOUT
                )));
            }
        }

        inner.connected.store(true, Ordering::Release);
        inner.publish_status("online", None).await;

        tracing::info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "mqtt connected"
        );
        Ok(Self { inner })
    }

    /// Register a handler run after every successful (re)connection
    pub fn set_on_connect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.on_connect.write().expect("lifecycle lock poisoned") =
            Some(Arc::new(handler));
    }

    /// Register a handler run when the connection drops
    pub fn set_on_disconnect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .inner
            .on_disconnect
            .write()
            .expect("lifecycle lock poisoned") = Some(Arc::new(handler));
    }

    /// Subscribe and record the subscription for restoration
    pub async fn subscribe<F>(&self, topic: &str, qos: u8, handler: F) -> Result<()>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        if topic.is_empty() {
            return Err(Error::InvalidTopic(topic.to_string()));
        }
        let qos = qos_from_u8(qos)?;

        // Record first: the registry is ground truth, and a reconnect racing
        // this call must still restore the subscription.
        {
            let mut map = self
                .inner
                .subscriptions
                .write()
                .expect("subscription lock poisoned");
            map.insert(
                topic.to_string(),
                Subscription {
                    qos,
                    handler: Arc::new(handler),
                },
            );
        }

        let outcome =
            tokio::time::timeout(OP_TIMEOUT, self.inner.client.subscribe(topic, qos)).await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.forget(topic);
                Err(Error::SubscribeFailed(e.to_string()))
            }
            Err(_) => {
                self.forget(topic);
                Err(Error::SubscribeFailed(format!(
                    "no acknowledgement for {:?} within {:?}",
                    topic, OP_TIMEOUT
                )))
            }
        }
    }

    /// Drop a recorded subscription
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.forget(topic);
        let _ = tokio::time::timeout(OP_TIMEOUT, self.inner.client.unsubscribe(topic)).await;
        Ok(())
    }

    /// Publish a payload
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retained: bool) -> Result<()> {
        if topic.is_empty() {
            return Err(Error::InvalidTopic(topic.to_string()));
        }
        let qos = qos_from_u8(qos)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PublishFailed(format!(
                "payload {} bytes exceeds {} byte limit",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }

        let outcome = tokio::time::timeout(
            OP_TIMEOUT,
            self.inner
                .client
                .publish(topic, qos, retained, payload.to_vec()),
        )
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::PublishFailed(e.to_string())),
            Err(_) => Err(Error::PublishFailed(format!(
                "publish to {:?} timed out after {:?}",
                topic, OP_TIMEOUT
            ))),
        }
    }

    /// Whether the broker link is currently up
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Read-only liveness probe
    pub fn health_check(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Publish the graceful-shutdown status and disconnect
    pub async fn close(&self) {
        if self.inner.connected.load(Ordering::Acquire) {
            self.inner
                .publish_status("offline", Some("graceful_shutdown"))
                .await;
        }

        // Let in-flight publishes drain before the socket goes away
        tokio::time::sleep(QUIESCE).await;

        self.inner.shutdown.cancel();
        let _ = self.inner.client.disconnect().await;
        self.inner.connected.store(false, Ordering::Release);

        if let Some(handle) = self.inner.driver.lock().await.take() {
            let _ = handle.await;
        }

        tracing::info!("mqtt connection closed");
    }

    fn forget(&self, topic: &str) {
        self.inner
            .subscriptions
            .write()
            .expect("subscription lock poisoned")
            .remove(topic);
    }

    #[cfg(test)]
    pub(crate) fn disconnected_for_tests() -> Self {
        let options = MqttOptions::new("test", "127.0.0.1", 1);
        let (client, event_loop) = AsyncClient::new(options, 64);
        // Keep the request channel open without running a driver
        std::mem::forget(event_loop);
        Self {
            inner: Arc::new(Inner {
                client,
                client_id: "test".to_string(),
                connected: AtomicBool::new(false),
                subscriptions: RwLock::new(HashMap::new()),
                on_connect: RwLock::new(None),
                on_disconnect: RwLock::new(None),
                shutdown: CancellationToken::new(),
                driver: Mutex::new(None),
            }),
        }
    }
}

fn qos_from_u8(qos: u8) -> Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::InvalidQos(other)),
    }
}

/// Event-loop driver: polls the library, restores subscriptions on every
/// ConnAck, dispatches publishes, and backs off on connection errors.
async fn drive(
    inner: Arc<Inner>,
    mut event_loop: rumqttc::EventLoop,
    initial_delay: Duration,
    max_delay: Duration,
    ready_tx: watch::Sender<bool>,
) {
    let mut delay = initial_delay;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    delay = initial_delay;
                    inner.connected.store(true, Ordering::Release);
                    let _ = ready_tx.send(true);

                    inner.restore_subscriptions().await;
                    inner.publish_status("online", None).await;
                    inner.run_lifecycle(&inner.on_connect, "on_connect");
                    tracing::info!("mqtt session established");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    inner.dispatch(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    let was_connected = inner.connected.swap(false, Ordering::AcqRel);
                    if was_connected {
                        inner.run_lifecycle(&inner.on_disconnect, "on_disconnect");
                    }
                    tracing::warn!(error = %e, retry_in = ?delay, "mqtt connection lost");

                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }

    inner.connected.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_publish_validation() {
        let client = MqttClient::disconnected_for_tests();

        assert!(matches!(
            client.publish("", b"x", 0, false).await,
            Err(Error::InvalidTopic(_))
        ));
        assert!(matches!(
            client.publish("graylogic/x", b"x", 3, false).await,
            Err(Error::InvalidQos(3))
        ));

        let huge = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            client.publish("graylogic/x", &huge, 1, false).await,
            Err(Error::PublishFailed(_))
        ));

        // Valid arguments but no connection
        assert!(matches!(
            client.publish("graylogic/x", b"x", 1, false).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_validation() {
        let client = MqttClient::disconnected_for_tests();

        assert!(matches!(
            client.subscribe("", 0, |_, _| {}).await,
            Err(Error::InvalidTopic(_))
        ));
        assert!(matches!(
            client.subscribe("graylogic/x", 7, |_, _| {}).await,
            Err(Error::InvalidQos(7))
        ));
    }

    #[tokio::test]
    async fn test_subscription_registry_records_and_forgets() {
        let client = MqttClient::disconnected_for_tests();

        client
            .subscribe("graylogic/state/knx/+", 1, |_, _| {})
            .await
            .expect("subscribe");
        assert!(client
            .inner
            .subscriptions
            .read()
            .unwrap()
            .contains_key("graylogic/state/knx/+"));

        client.unsubscribe("graylogic/state/knx/+").await.unwrap();
        assert!(client.inner.subscriptions.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_matches_wildcards() {
        let client = MqttClient::disconnected_for_tests();
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = hits.clone();
        client
            .subscribe("graylogic/state/knx/+", 0, move |topic, payload| {
                assert_eq!(topic, "graylogic/state/knx/light-1");
                assert_eq!(payload, b"{\"on\":true}");
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .expect("subscribe");

        client
            .inner
            .dispatch("graylogic/state/knx/light-1", b"{\"on\":true}");
        client.inner.dispatch("graylogic/state/zigbee/x", b"{}");

        // Handlers run on spawned tasks
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_isolates_panics() {
        let client = MqttClient::disconnected_for_tests();
        let hits = Arc::new(AtomicUsize::new(0));

        client
            .subscribe("graylogic/command/#", 0, |_, _| {
                panic!("handler exploded");
            })
            .await
            .expect("subscribe");
        let counted = hits.clone();
        client
            .subscribe("graylogic/command/knx/+", 0, move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .expect("subscribe");

        client.inner.dispatch("graylogic/command/knx/1-0-1", b"on");

        tokio::time::sleep(Duration::from_millis(50)).await;
        // The panicking sibling did not stop the healthy handler
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_qos_conversion() {
        assert!(matches!(qos_from_u8(0), Ok(QoS::AtMostOnce)));
        assert!(matches!(qos_from_u8(1), Ok(QoS::AtLeastOnce)));
        assert!(matches!(qos_from_u8(2), Ok(QoS::ExactlyOnce)));
        assert!(matches!(qos_from_u8(3), Err(Error::InvalidQos(3))));
    }

    #[test]
    fn test_status_payload_shape() {
        let client = MqttClient::disconnected_for_tests();
        let payload = client
            .inner
            .status_payload("offline", Some("unexpected_disconnect"));
        let doc: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(doc["status"], "offline");
        assert_eq!(doc["reason"], "unexpected_disconnect");
        assert_eq!(doc["client_id"], "test");
        assert!(doc["timestamp"].is_string());

        let payload = client.inner.status_payload("online", None);
        let doc: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert!(doc.get("reason").is_none());
    }
}
