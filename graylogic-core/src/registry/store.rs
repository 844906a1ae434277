//! Durable mirror of the device catalogue
//!
//! Plain SQL against the shared single-writer pool. The JSON-shaped fields
//! (address, capabilities, state, settings) are stored as JSON text columns.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::registry::device::{Device, Domain, HealthStatus};

/// SQLite repository for devices
#[derive(Clone)]
pub struct DeviceRepository {
    pool: SqlitePool,
}

impl DeviceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, device: &Device) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO devices (
                id, slug, name, room_id, area_id, domain, device_type, protocol,
                address, capabilities, state, state_updated_at,
                health, health_last_seen, gateway_id,
                manufacturer, model, firmware, settings, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21
            )
            "#,
        )
        .bind(&device.id)
        .bind(&device.slug)
        .bind(&device.name)
        .bind(&device.room_id)
        .bind(&device.area_id)
        .bind(device.domain.as_str())
        .bind(&device.device_type)
        .bind(&device.protocol)
        .bind(to_json(&device.address)?)
        .bind(to_json(&device.capabilities)?)
        .bind(to_json(&device.state)?)
        .bind(device.state_updated_at.map(|t| t.to_rfc3339()))
        .bind(device.health.as_str())
        .bind(device.health_last_seen.map(|t| t.to_rfc3339()))
        .bind(&device.gateway_id)
        .bind(&device.manufacturer)
        .bind(&device.model)
        .bind(&device.firmware)
        .bind(to_json(&device.settings)?)
        .bind(device.created_at.to_rfc3339())
        .bind(device.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::DeviceExists(device.slug.clone())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update(&self, device: &Device) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET
                slug = ?2, name = ?3, room_id = ?4, area_id = ?5, domain = ?6,
                device_type = ?7, protocol = ?8, address = ?9, capabilities = ?10,
                state = ?11, state_updated_at = ?12, health = ?13,
                health_last_seen = ?14, gateway_id = ?15, manufacturer = ?16,
                model = ?17, firmware = ?18, settings = ?19, updated_at = ?20
            WHERE id = ?1
            "#,
        )
        .bind(&device.id)
        .bind(&device.slug)
        .bind(&device.name)
        .bind(&device.room_id)
        .bind(&device.area_id)
        .bind(device.domain.as_str())
        .bind(&device.device_type)
        .bind(&device.protocol)
        .bind(to_json(&device.address)?)
        .bind(to_json(&device.capabilities)?)
        .bind(to_json(&device.state)?)
        .bind(device.state_updated_at.map(|t| t.to_rfc3339()))
        .bind(device.health.as_str())
        .bind(device.health_last_seen.map(|t| t.to_rfc3339()))
        .bind(&device.gateway_id)
        .bind(&device.manufacturer)
        .bind(&device.model)
        .bind(&device.firmware)
        .bind(to_json(&device.settings)?)
        .bind(device.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                Err(Error::DeviceNotFound(device.id.clone()))
            }
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::DeviceExists(device.slug.clone())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let done = sqlx::query("DELETE FROM devices WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::DeviceNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_device(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query("SELECT * FROM devices ORDER BY slug")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_device).collect()
    }

    /// Hot-path state write-through: only the state columns move
    pub async fn update_state(
        &self,
        id: &str,
        state: &BTreeMap<String, serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let done = sqlx::query(
            "UPDATE devices SET state = ?2, state_updated_at = ?3, updated_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(to_json(state)?)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(Error::DeviceNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Hot-path health write-through
    pub async fn update_health(
        &self,
        id: &str,
        health: HealthStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let done = sqlx::query(
            "UPDATE devices SET health = ?2, health_last_seen = ?3, updated_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(health.as_str())
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(Error::DeviceNotFound(id.to_string()));
        }
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Other(format!("JSON encode: {}", e)))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str, column: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| Error::Other(format!("JSON decode of column {}: {}", column, e)))
}

fn parse_instant(text: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>> {
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Other(format!("timestamp decode of column {}: {}", column, e)))
    })
    .transpose()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

fn row_to_device(row: &SqliteRow) -> Result<Device> {
    let domain: String = row.try_get("domain")?;
    let health: String = row.try_get("health")?;
    let address: String = row.try_get("address")?;
    let capabilities: String = row.try_get("capabilities")?;
    let state: String = row.try_get("state")?;
    let settings: String = row.try_get("settings")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Device {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        room_id: row.try_get("room_id")?,
        area_id: row.try_get("area_id")?,
        domain: Domain::from_str(&domain)?,
        device_type: row.try_get("device_type")?,
        protocol: row.try_get("protocol")?,
        address: from_json(&address, "address")?,
        capabilities: from_json(&capabilities, "capabilities")?,
        state: from_json(&state, "state")?,
        state_updated_at: parse_instant(row.try_get("state_updated_at")?, "state_updated_at")?,
        health: HealthStatus::from_str(&health)?,
        health_last_seen: parse_instant(row.try_get("health_last_seen")?, "health_last_seen")?,
        gateway_id: row.try_get("gateway_id")?,
        manufacturer: row.try_get("manufacturer")?,
        model: row.try_get("model")?,
        firmware: row.try_get("firmware")?,
        settings: from_json(&settings, "settings")?,
        created_at: parse_instant(Some(created_at), "created_at")?
            .unwrap_or_else(Utc::now),
        updated_at: parse_instant(Some(updated_at), "updated_at")?
            .unwrap_or_else(Utc::now),
    })
}
