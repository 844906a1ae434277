//! The in-memory device registry
//!
//! Source of truth for the catalogue and the high-frequency state/health
//! plane. One reader-writer lock guards the primary map and every secondary
//! index; index rebuilds share the write critical section that mutates the
//! primary, so readers never observe a half-built index. Persistence is
//! write-through to [`DeviceRepository`] before the cache mutates, so a
//! failed write leaves the cache clean.
//!
//! Every read hands out a clone. The maps and vectors inside [`Device`] are
//! owned, so a caller mutating what it received cannot corrupt the cache.

pub mod device;
pub mod locations;
pub mod store;

pub use device::{Device, Domain, HealthStatus, KNOWN_CAPABILITIES, KNOWN_PROTOCOLS};
pub use locations::{Area, InfrastructureZone, LocationRepository, Room, Site};
pub use store::DeviceRepository;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Counts by classification, as reported by [`DeviceRegistry::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub by_domain: BTreeMap<String, usize>,
    pub by_protocol: BTreeMap<String, usize>,
    pub by_health: BTreeMap<String, usize>,
}

#[derive(Default)]
struct Catalog {
    by_id: HashMap<String, Device>,
    slug_to_id: HashMap<String, String>,
    by_room: HashMap<String, BTreeSet<String>>,
    by_area: HashMap<String, BTreeSet<String>>,
    by_domain: HashMap<Domain, BTreeSet<String>>,
    by_protocol: HashMap<String, BTreeSet<String>>,
    by_capability: HashMap<String, BTreeSet<String>>,
    by_health: HashMap<HealthStatus, BTreeSet<String>>,
    by_gateway: HashMap<String, BTreeSet<String>>,
}

impl Catalog {
    fn index(&mut self, device: &Device) {
        let id = device.id.clone();
        self.slug_to_id.insert(device.slug.clone(), id.clone());
        if let Some(room) = &device.room_id {
            self.by_room.entry(room.clone()).or_default().insert(id.clone());
        }
        if let Some(area) = &device.area_id {
            self.by_area.entry(area.clone()).or_default().insert(id.clone());
        }
        self.by_domain
            .entry(device.domain)
            .or_default()
            .insert(id.clone());
        self.by_protocol
            .entry(device.protocol.clone())
            .or_default()
            .insert(id.clone());
        for capability in &device.capabilities {
            self.by_capability
                .entry(capability.clone())
                .or_default()
                .insert(id.clone());
        }
        self.by_health
            .entry(device.health)
            .or_default()
            .insert(id.clone());
        if let Some(gateway) = &device.gateway_id {
            self.by_gateway
                .entry(gateway.clone())
                .or_default()
                .insert(id);
        }
    }

    fn unindex(&mut self, device: &Device) {
        let id = &device.id;
        self.slug_to_id.remove(&device.slug);
        if let Some(room) = &device.room_id {
            prune(&mut self.by_room, room, id);
        }
        if let Some(area) = &device.area_id {
            prune(&mut self.by_area, area, id);
        }
        if let Some(set) = self.by_domain.get_mut(&device.domain) {
            set.remove(id);
            if set.is_empty() {
                self.by_domain.remove(&device.domain);
            }
        }
        prune(&mut self.by_protocol, &device.protocol, id);
        for capability in &device.capabilities {
            prune(&mut self.by_capability, capability, id);
        }
        if let Some(set) = self.by_health.get_mut(&device.health) {
            set.remove(id);
            if set.is_empty() {
                self.by_health.remove(&device.health);
            }
        }
        if let Some(gateway) = &device.gateway_id {
            prune(&mut self.by_gateway, gateway, id);
        }
    }

    fn collect(&self, ids: Option<&BTreeSet<String>>) -> Vec<Device> {
        let mut devices: Vec<Device> = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.by_id.get(id))
                .cloned()
                .collect(),
            None => self.by_id.values().cloned().collect(),
        };
        devices.sort_by(|a, b| a.slug.cmp(&b.slug));
        devices
    }
}

fn prune(index: &mut HashMap<String, BTreeSet<String>>, key: &str, id: &str) {
    if let Some(set) = index.get_mut(key) {
        set.remove(id);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

/// Cached, multi-indexed device catalogue over a SQLite mirror
pub struct DeviceRegistry {
    repository: DeviceRepository,
    catalog: RwLock<Catalog>,
}

impl DeviceRegistry {
    pub fn new(repository: DeviceRepository) -> Self {
        Self {
            repository,
            catalog: RwLock::new(Catalog::default()),
        }
    }

    /// Validate, persist, and cache a new device
    ///
    /// Generates an id when the caller left it empty and derives the slug
    /// from the name when unset.
    pub async fn create_device(&self, mut device: Device) -> Result<Device> {
        if device.id.is_empty() {
            device.id = uuid::Uuid::new_v4().to_string();
        }
        if device.slug.is_empty() {
            device.slug = device::slugify(&device.name);
        }
        let now = Utc::now();
        device.created_at = now;
        device.updated_at = now;
        device.validate()?;

        let mut catalog = self.catalog.write().await;
        if catalog.slug_to_id.contains_key(&device.slug) {
            return Err(Error::DeviceExists(device.slug));
        }

        self.repository.insert(&device).await?;
        catalog.by_id.insert(device.id.clone(), device.clone());
        catalog.index(&device);

        tracing::info!(id = %device.id, slug = %device.slug, "device created");
        Ok(device)
    }

    pub async fn get_device(&self, id: &str) -> Result<Device> {
        self.catalog
            .read()
            .await
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))
    }

    pub async fn get_device_by_slug(&self, slug: &str) -> Result<Device> {
        let catalog = self.catalog.read().await;
        catalog
            .slug_to_id
            .get(slug)
            .and_then(|id| catalog.by_id.get(id))
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(slug.to_string()))
    }

    /// Every device, slug-ordered
    pub async fn list_devices(&self) -> Vec<Device> {
        self.catalog.read().await.collect(None)
    }

    pub async fn get_devices_by_room(&self, room_id: &str) -> Vec<Device> {
        let catalog = self.catalog.read().await;
        catalog.collect(catalog.by_room.get(room_id))
    }

    pub async fn get_devices_by_area(&self, area_id: &str) -> Vec<Device> {
        let catalog = self.catalog.read().await;
        catalog.collect(catalog.by_area.get(area_id))
    }

    pub async fn get_devices_by_domain(&self, domain: Domain) -> Vec<Device> {
        let catalog = self.catalog.read().await;
        catalog.collect(catalog.by_domain.get(&domain))
    }

    pub async fn get_devices_by_protocol(&self, protocol: &str) -> Vec<Device> {
        let catalog = self.catalog.read().await;
        catalog.collect(catalog.by_protocol.get(protocol))
    }

    pub async fn get_devices_by_capability(&self, capability: &str) -> Vec<Device> {
        let catalog = self.catalog.read().await;
        catalog.collect(catalog.by_capability.get(capability))
    }

    pub async fn get_devices_by_health(&self, health: HealthStatus) -> Vec<Device> {
        let catalog = self.catalog.read().await;
        catalog.collect(catalog.by_health.get(&health))
    }

    pub async fn get_devices_by_gateway(&self, gateway_id: &str) -> Vec<Device> {
        let catalog = self.catalog.read().await;
        catalog.collect(catalog.by_gateway.get(gateway_id))
    }

    /// Resolve a device by its routing key
    pub async fn get_device_by_address(&self, protocol: &str, canonical: &str) -> Option<Device> {
        let catalog = self.catalog.read().await;
        catalog
            .by_protocol
            .get(protocol)
            .into_iter()
            .flatten()
            .filter_map(|id| catalog.by_id.get(id))
            .find(|d| d.address_canonical() == canonical)
            .cloned()
    }

    /// Replace a device's catalogue row; indexes rebuild atomically
    pub async fn update_device(&self, mut device: Device) -> Result<Device> {
        device.validate()?;

        let mut catalog = self.catalog.write().await;
        let existing = catalog
            .by_id
            .get(&device.id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(device.id.clone()))?;

        if device.slug != existing.slug {
            if let Some(other) = catalog.slug_to_id.get(&device.slug) {
                if other != &device.id {
                    return Err(Error::DeviceExists(device.slug));
                }
            }
        }

        device.created_at = existing.created_at;
        device.updated_at = Utc::now();

        self.repository.update(&device).await?;
        catalog.unindex(&existing);
        catalog.by_id.insert(device.id.clone(), device.clone());
        catalog.index(&device);

        Ok(device)
    }

    pub async fn delete_device(&self, id: &str) -> Result<()> {
        let mut catalog = self.catalog.write().await;
        let existing = catalog
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;

        self.repository.delete(id).await?;
        catalog.unindex(&existing);
        catalog.by_id.remove(id);

        tracing::info!(id, slug = %existing.slug, "device deleted");
        Ok(())
    }

    /// Merge new state into the device; last writer wins
    pub async fn set_device_state(
        &self,
        id: &str,
        state: BTreeMap<String, Value>,
    ) -> Result<()> {
        let mut catalog = self.catalog.write().await;
        let device = catalog
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;

        let mut merged = device.state.clone();
        for (key, value) in state {
            merged.insert(key, value);
        }
        let at = Utc::now();

        self.repository.update_state(id, &merged, at).await?;
        device.state = merged;
        device.state_updated_at = Some(at);
        device.updated_at = at;
        Ok(())
    }

    /// Update reachability; the health index moves in the same section
    pub async fn set_device_health(&self, id: &str, health: HealthStatus) -> Result<()> {
        let mut catalog = self.catalog.write().await;
        let previous = match catalog.by_id.get(id) {
            Some(device) => device.health,
            None => return Err(Error::DeviceNotFound(id.to_string())),
        };

        let at = Utc::now();
        self.repository.update_health(id, health, at).await?;

        if let Some(set) = catalog.by_health.get_mut(&previous) {
            set.remove(id);
            if set.is_empty() {
                catalog.by_health.remove(&previous);
            }
        }
        catalog
            .by_health
            .entry(health)
            .or_default()
            .insert(id.to_string());

        let device = catalog
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        device.health = health;
        device.health_last_seen = Some(at);
        device.updated_at = at;
        Ok(())
    }

    /// Reload the whole catalogue from persistence
    pub async fn refresh_cache(&self) -> Result<()> {
        let devices = self.repository.list().await?;

        let mut rebuilt = Catalog::default();
        for device in devices {
            rebuilt.by_id.insert(device.id.clone(), device.clone());
            rebuilt.index(&device);
        }
        let total = rebuilt.by_id.len();

        *self.catalog.write().await = rebuilt;
        tracing::info!(devices = total, "device cache refreshed");
        Ok(())
    }

    pub async fn stats(&self) -> RegistryStats {
        let catalog = self.catalog.read().await;
        let mut stats = RegistryStats {
            total: catalog.by_id.len(),
            ..Default::default()
        };
        for device in catalog.by_id.values() {
            *stats
                .by_domain
                .entry(device.domain.as_str().to_string())
                .or_default() += 1;
            *stats.by_protocol.entry(device.protocol.clone()).or_default() += 1;
            *stats
                .by_health
                .entry(device.health.as_str().to_string())
                .or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_pool;
    use serde_json::json;
    use std::sync::Arc;

    async fn registry() -> (Arc<DeviceRegistry>, tempfile::TempDir) {
        let (pool, dir) = test_pool().await;
        (
            Arc::new(DeviceRegistry::new(DeviceRepository::new(pool))),
            dir,
        )
    }

    fn knx_device(name: &str, ga: &str) -> Device {
        let mut device = Device::new(name, Domain::Lighting, "knx");
        device
            .address
            .insert("group_address".to_string(), json!(ga));
        device.capabilities = vec!["on_off".to_string()];
        device
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let (registry, _dir) = registry().await;

        let created = registry
            .create_device(knx_device("Hall Light", "1/0/1"))
            .await
            .expect("create");
        assert_eq!(created.slug, "hall-light");

        let by_id = registry.get_device(&created.id).await.expect("by id");
        assert_eq!(by_id.name, "Hall Light");

        let by_slug = registry
            .get_device_by_slug("hall-light")
            .await
            .expect("by slug");
        assert_eq!(by_slug.id, created.id);

        assert!(matches!(
            registry.get_device("missing").await,
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_slug_rejected() {
        let (registry, _dir) = registry().await;
        registry
            .create_device(knx_device("Hall Light", "1/0/1"))
            .await
            .expect("first");
        let result = registry
            .create_device(knx_device("Hall Light", "1/0/2"))
            .await;
        assert!(matches!(result, Err(Error::DeviceExists(_))));
    }

    #[tokio::test]
    async fn test_read_isolation() {
        let (registry, _dir) = registry().await;
        let created = registry
            .create_device(knx_device("Hall Light", "1/0/1"))
            .await
            .expect("create");

        // Mutate everything on the returned copy
        let mut copy = registry.get_device(&created.id).await.unwrap();
        copy.address.insert("group_address".to_string(), json!("9/9/9"));
        copy.state.insert("on".to_string(), json!(true));
        copy.capabilities.push("dim".to_string());
        copy.name = "Corrupted".to_string();

        // Subsequent reads are unaffected
        let fresh = registry.get_device(&created.id).await.unwrap();
        assert_eq!(fresh.address.get("group_address"), Some(&json!("1/0/1")));
        assert!(fresh.state.is_empty());
        assert_eq!(fresh.capabilities, vec!["on_off".to_string()]);
        assert_eq!(fresh.name, "Hall Light");
    }

    #[tokio::test]
    async fn test_secondary_indexes() {
        let (registry, _dir) = registry().await;

        let mut lamp = knx_device("Lamp", "1/0/1");
        lamp.room_id = Some("room-a".to_string());
        lamp.gateway_id = Some("gw-1".to_string());
        let lamp = registry.create_device(lamp).await.expect("lamp");

        let mut sensor = Device::new("Temp Sensor", Domain::Sensor, "virtual");
        sensor.room_id = Some("room-b".to_string());
        sensor.capabilities = vec!["temperature_read".to_string()];
        let sensor = registry.create_device(sensor).await.expect("sensor");

        assert_eq!(
            registry.get_devices_by_room("room-a").await[0].id,
            lamp.id
        );
        assert_eq!(
            registry.get_devices_by_domain(Domain::Sensor).await[0].id,
            sensor.id
        );
        assert_eq!(registry.get_devices_by_protocol("knx").await.len(), 1);
        assert_eq!(
            registry.get_devices_by_capability("temperature_read").await[0].id,
            sensor.id
        );
        assert_eq!(
            registry
                .get_devices_by_health(HealthStatus::Unknown)
                .await
                .len(),
            2
        );
        assert_eq!(
            registry.get_devices_by_gateway("gw-1").await[0].id,
            lamp.id
        );
        assert!(registry.get_devices_by_room("room-z").await.is_empty());
    }

    #[tokio::test]
    async fn test_update_moves_indexes() {
        let (registry, _dir) = registry().await;
        let mut device = knx_device("Lamp", "1/0/1");
        device.room_id = Some("room-a".to_string());
        let created = registry.create_device(device).await.expect("create");

        let mut updated = created.clone();
        updated.room_id = Some("room-b".to_string());
        updated.name = "Moved Lamp".to_string();
        updated.slug = "moved-lamp".to_string();
        registry.update_device(updated).await.expect("update");

        // Old entries gone, new ones present
        assert!(registry.get_devices_by_room("room-a").await.is_empty());
        assert_eq!(registry.get_devices_by_room("room-b").await.len(), 1);
        assert!(registry.get_device_by_slug("lamp").await.is_err());
        assert!(registry.get_device_by_slug("moved-lamp").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_rename_race() {
        let (registry, _dir) = registry().await;
        let created = registry
            .create_device(knx_device("Lamp", "1/0/1"))
            .await
            .expect("create");

        let mut first = created.clone();
        first.name = "Name One".to_string();
        let mut second = created.clone();
        second.name = "Name Two".to_string();

        let registry_a = registry.clone();
        let registry_b = registry.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { registry_a.update_device(first).await }),
            tokio::spawn(async move { registry_b.update_device(second).await }),
        );
        // Both complete without error
        a.unwrap().expect("first update");
        b.unwrap().expect("second update");

        // Final row is one of the two inputs, with no leaked index entry
        let device = registry.get_device(&created.id).await.unwrap();
        assert!(device.name == "Name One" || device.name == "Name Two");
        assert_eq!(registry.list_devices().await.len(), 1);
    }

    #[tokio::test]
    async fn test_state_merge_and_write_through() {
        let (registry, _dir) = registry().await;
        let created = registry
            .create_device(knx_device("Lamp", "1/0/1"))
            .await
            .expect("create");

        let mut first = BTreeMap::new();
        first.insert("on".to_string(), json!(true));
        registry
            .set_device_state(&created.id, first)
            .await
            .expect("state 1");

        let mut second = BTreeMap::new();
        second.insert("brightness".to_string(), json!(70));
        registry
            .set_device_state(&created.id, second)
            .await
            .expect("state 2");

        let device = registry.get_device(&created.id).await.unwrap();
        assert_eq!(device.state.get("on"), Some(&json!(true)));
        assert_eq!(device.state.get("brightness"), Some(&json!(70)));
        assert!(device.state_updated_at.is_some());

        // Survives a full cache reload (durable write-through)
        registry.refresh_cache().await.expect("refresh");
        let device = registry.get_device(&created.id).await.unwrap();
        assert_eq!(device.state.get("brightness"), Some(&json!(70)));
    }

    #[tokio::test]
    async fn test_health_updates_index() {
        let (registry, _dir) = registry().await;
        let created = registry
            .create_device(knx_device("Lamp", "1/0/1"))
            .await
            .expect("create");

        registry
            .set_device_health(&created.id, HealthStatus::Online)
            .await
            .expect("health");

        assert!(registry
            .get_devices_by_health(HealthStatus::Unknown)
            .await
            .is_empty());
        let online = registry.get_devices_by_health(HealthStatus::Online).await;
        assert_eq!(online.len(), 1);
        assert!(online[0].health_last_seen.is_some());
    }

    #[tokio::test]
    async fn test_delete_clears_all_indexes() {
        let (registry, _dir) = registry().await;
        let mut device = knx_device("Lamp", "1/0/1");
        device.room_id = Some("room-a".to_string());
        let created = registry.create_device(device).await.expect("create");

        registry.delete_device(&created.id).await.expect("delete");

        assert!(registry.get_device(&created.id).await.is_err());
        assert!(registry.get_device_by_slug("lamp").await.is_err());
        assert!(registry.get_devices_by_room("room-a").await.is_empty());
        assert!(registry.get_devices_by_protocol("knx").await.is_empty());
        assert!(matches!(
            registry.delete_device(&created.id).await,
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_cache_rebuilds() {
        let (pool, _dir) = test_pool().await;
        let repo = DeviceRepository::new(pool.clone());
        let registry = DeviceRegistry::new(repo.clone());

        // A row written behind the registry's back
        let mut device = knx_device("Backdoor", "2/0/1");
        device.created_at = Utc::now();
        device.updated_at = device.created_at;
        repo.insert(&device).await.expect("raw insert");

        assert!(registry.list_devices().await.is_empty());
        registry.refresh_cache().await.expect("refresh");

        let loaded = registry.get_device_by_slug("backdoor").await.expect("cached");
        assert_eq!(loaded.id, device.id);
        assert_eq!(registry.get_devices_by_protocol("knx").await.len(), 1);
    }

    #[tokio::test]
    async fn test_routing_key_lookup() {
        let (registry, _dir) = registry().await;
        let created = registry
            .create_device(knx_device("Lamp", "1/0/1"))
            .await
            .expect("create");

        let canonical = created.address_canonical();
        let hit = registry.get_device_by_address("knx", &canonical).await;
        assert_eq!(hit.map(|d| d.id), Some(created.id));

        assert!(registry
            .get_device_by_address("knx", "{\"group_address\":\"9/9/9\"}")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let (registry, _dir) = registry().await;
        registry
            .create_device(knx_device("Lamp", "1/0/1"))
            .await
            .expect("lamp");
        let mut sensor = Device::new("Sensor", Domain::Sensor, "virtual");
        sensor.capabilities = vec!["temperature_read".to_string()];
        registry.create_device(sensor).await.expect("sensor");

        let stats = registry.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_domain.get("lighting"), Some(&1));
        assert_eq!(stats.by_domain.get("sensor"), Some(&1));
        assert_eq!(stats.by_protocol.get("knx"), Some(&1));
        assert_eq!(stats.by_health.get("unknown"), Some(&2));
    }

    #[tokio::test]
    async fn test_validation_rejected_before_mutation() {
        let (registry, _dir) = registry().await;
        // KNX device without an address never reaches the store or cache
        let device = Device::new("Broken", Domain::Lighting, "knx");
        assert!(matches!(
            registry.create_device(device).await,
            Err(Error::Validation(_))
        ));
        assert!(registry.list_devices().await.is_empty());
    }
}
