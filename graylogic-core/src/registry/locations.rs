//! Sites, areas, rooms, and infrastructure zones
//!
//! The spatial catalogue the device registry and room scoping hang off.
//! Hierarchy: site → area → room; infrastructure zones cut across it
//! (a heating circuit or a ventilation branch spans rooms from several
//! areas). Deleting a site cascades through its areas; deleting an area
//! orphans its rooms rather than destroying them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};

/// A building or property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A floor or wing within a site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub id: String,
    pub site_id: Option<String>,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A room; the unit of access scoping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub area_id: Option<String>,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A cross-cutting technical zone (heating circuit, ventilation branch)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfrastructureZone {
    pub id: String,
    pub name: String,
    pub zone_type: String,
}

/// SQLite repository for the spatial catalogue
#[derive(Clone)]
pub struct LocationRepository {
    pool: SqlitePool,
}

impl LocationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ------------------------------------------------------------------
    // Sites
    // ------------------------------------------------------------------

    pub async fn create_site(&self, name: &str) -> Result<Site> {
        let site = Site {
            id: prefixed_id("site"),
            name: validated_name(name)?,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        sqlx::query("INSERT INTO sites (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(&site.id)
            .bind(&site.name)
            .bind(site.created_at.to_rfc3339())
            .bind(site.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(site)
    }

    pub async fn list_sites(&self) -> Result<Vec<Site>> {
        let rows = sqlx::query("SELECT * FROM sites ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_site).collect()
    }

    pub async fn delete_site(&self, id: &str) -> Result<()> {
        let done = sqlx::query("DELETE FROM sites WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::Validation(format!("no such site: {}", id)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Areas
    // ------------------------------------------------------------------

    pub async fn create_area(&self, site_id: Option<&str>, name: &str) -> Result<Area> {
        let area = Area {
            id: prefixed_id("area"),
            site_id: site_id.map(str::to_string),
            name: validated_name(name)?,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO areas (id, site_id, name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&area.id)
        .bind(&area.site_id)
        .bind(&area.name)
        .bind(area.created_at.to_rfc3339())
        .bind(area.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(area)
    }

    pub async fn list_areas(&self, site_id: Option<&str>) -> Result<Vec<Area>> {
        let rows = match site_id {
            Some(site_id) => {
                sqlx::query("SELECT * FROM areas WHERE site_id = ?1 ORDER BY name")
                    .bind(site_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM areas ORDER BY name")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_area).collect()
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    pub async fn create_room(&self, area_id: Option<&str>, name: &str) -> Result<Room> {
        let room = Room {
            id: prefixed_id("room"),
            area_id: area_id.map(str::to_string),
            name: validated_name(name)?,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO rooms (id, area_id, name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&room.id)
        .bind(&room.area_id)
        .bind(&room.name)
        .bind(room.created_at.to_rfc3339())
        .bind(room.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(room)
    }

    pub async fn get_room(&self, id: &str) -> Result<Room> {
        let row = sqlx::query("SELECT * FROM rooms WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_room(&r))
            .transpose()?
            .ok_or_else(|| Error::Validation(format!("no such room: {}", id)))
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>> {
        let rows = sqlx::query("SELECT * FROM rooms ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_room).collect()
    }

    pub async fn delete_room(&self, id: &str) -> Result<()> {
        let done = sqlx::query("DELETE FROM rooms WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::Validation(format!("no such room: {}", id)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Infrastructure zones
    // ------------------------------------------------------------------

    pub async fn create_zone(&self, name: &str, zone_type: &str) -> Result<InfrastructureZone> {
        let zone = InfrastructureZone {
            id: prefixed_id("zone"),
            name: validated_name(name)?,
            zone_type: zone_type.to_string(),
        };
        sqlx::query("INSERT INTO infrastructure_zones (id, name, zone_type) VALUES (?1, ?2, ?3)")
            .bind(&zone.id)
            .bind(&zone.name)
            .bind(&zone.zone_type)
            .execute(&self.pool)
            .await?;
        Ok(zone)
    }

    pub async fn assign_room_to_zone(&self, zone_id: &str, room_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO infrastructure_zone_rooms (zone_id, room_id) VALUES (?1, ?2)
             ON CONFLICT (zone_id, room_id) DO NOTHING",
        )
        .bind(zone_id)
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn rooms_in_zone(&self, zone_id: &str) -> Result<Vec<Room>> {
        let rows = sqlx::query(
            "SELECT r.* FROM rooms r
             JOIN infrastructure_zone_rooms z ON z.room_id = r.id
             WHERE z.zone_id = ?1 ORDER BY r.name",
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_room).collect()
    }
}

fn prefixed_id(prefix: &str) -> String {
    format!("{}-{}", prefix, &uuid::Uuid::new_v4().to_string()[..8])
}

fn validated_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.len() > 100 {
        return Err(Error::Validation(
            "location name must be 1-100 characters".to_string(),
        ));
    }
    Ok(name.to_string())
}

fn parse_instant(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_site(row: &SqliteRow) -> Result<Site> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Site {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: parse_instant(&created_at),
        updated_at: parse_instant(&updated_at),
    })
}

fn row_to_area(row: &SqliteRow) -> Result<Area> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Area {
        id: row.try_get("id")?,
        site_id: row.try_get("site_id")?,
        name: row.try_get("name")?,
        created_at: parse_instant(&created_at),
        updated_at: parse_instant(&updated_at),
    })
}

fn row_to_room(row: &SqliteRow) -> Result<Room> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Room {
        id: row.try_get("id")?,
        area_id: row.try_get("area_id")?,
        name: row.try_get("name")?,
        created_at: parse_instant(&created_at),
        updated_at: parse_instant(&updated_at),
    })
}
