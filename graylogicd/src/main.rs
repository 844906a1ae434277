//! graylogicd — the Gray Logic control daemon
//!
//! Startup order: configuration → tracing → database + migrations → owner
//! bootstrap → device-catalogue warm-up → MQTT (bounded retries) → knxd
//! supervision → KNX wire client → bridge. Any startup failure exits
//! non-zero; after startup the daemon rides out subsystem failures and
//! rebinds on reconnect. SIGINT/SIGTERM trigger an orderly teardown and
//! exit 0.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use graylogic_core::auth::{seed_owner, RefreshTokenRepository};
use graylogic_core::prelude::*;

mod bridge;

const MQTT_CONNECT_ATTEMPTS: u32 = 5;
const KNX_CONNECT_ATTEMPTS: u32 = 10;
const TOKEN_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "startup failed");
            eprintln!("graylogicd: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;
    init_tracing(&config)?;
    config.validate().context("validating configuration")?;

    let pool = database::open_pool(&config.database)
        .await
        .context("opening database")?;
    database::migrate(&pool).await.context("applying migrations")?;

    let users = UserRepository::new(pool.clone());
    let hasher = PasswordHasher::new();
    seed_owner(&users, &hasher).await.context("owner bootstrap")?;

    let registry = Arc::new(DeviceRegistry::new(DeviceRepository::new(pool.clone())));
    registry
        .refresh_cache()
        .await
        .context("loading device catalogue")?;

    let mqtt = connect_mqtt(&config).await.context("mqtt initial connect")?;

    let controller = if config.knxd.managed {
        let controller = KnxdController::new(config.knxd.clone());
        controller.start().await.context("starting knxd")?;
        Some(controller)
    } else {
        None
    };

    let knx = connect_knx(&config).await.context("knxd wire connect")?;
    if let Some(controller) = &controller {
        controller.attach_client(knx.clone());
    }

    let bridge = bridge::Bridge::new(registry.clone(), mqtt.clone(), knx.clone());
    bridge.start().await.context("starting bridge")?;

    spawn_token_purge(RefreshTokenRepository::new(pool.clone()));

    tracing::info!(service = %config.service.name, "graylogic core running");
    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    knx.close().await;
    if let Some(controller) = controller {
        controller.stop().await;
    }
    mqtt.close().await;

    tracing::info!("graceful shutdown complete");
    Ok(())
}

/// Connect to the broker with bounded exponential retries
async fn connect_mqtt(config: &Config) -> anyhow::Result<MqttClient> {
    let mut delay = config.mqtt.reconnect_initial_delay();
    for attempt in 1..=MQTT_CONNECT_ATTEMPTS {
        match MqttClient::connect(&config.mqtt).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt < MQTT_CONNECT_ATTEMPTS => {
                tracing::warn!(attempt, error = %e, retry_in = ?delay, "mqtt connect failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(config.mqtt.reconnect_max_delay());
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("loop returns on success or final error")
}

/// Dial knxd with bounded retries; the supervised daemon needs a moment
/// to open its TCP server on first start
async fn connect_knx(config: &Config) -> anyhow::Result<KnxClient> {
    let mut delay = Duration::from_millis(500);
    for attempt in 1..=KNX_CONNECT_ATTEMPTS {
        match KnxClient::connect(&config.knx).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt < KNX_CONNECT_ATTEMPTS => {
                tracing::warn!(attempt, error = %e, retry_in = ?delay, "knxd connect failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(10));
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("loop returns on success or final error")
}

/// Hourly cleanup of expired refresh-token rows
fn spawn_token_purge(tokens: RefreshTokenRepository) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TOKEN_PURGE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            match tokens.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::info!(purged, "expired refresh tokens purged"),
                Err(e) => tracing::warn!(error = %e, "refresh token purge failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "sigterm handler install failed");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
