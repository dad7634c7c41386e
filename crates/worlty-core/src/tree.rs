//! Device tree synchronizer.
//!
//! Flattens the gateway's nested device/child batches into the authoritative
//! entity map keyed by unique id, keeps the per-platform discovery view and
//! the health map, and routes each merged record either to its registered
//! entity or to the discovery callbacks of its platform.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use worlty_types::{DeviceRecord, Platform, UniqueId};

/// Receives the raw record whenever the record backing an entity changes
pub trait EntityListener: Send + Sync {
    /// Returns `false` once the entity is gone, which unregisters it.
    fn record_updated(&self, record: &DeviceRecord) -> bool;
}

impl EntityListener for mpsc::UnboundedSender<DeviceRecord> {
    fn record_updated(&self, record: &DeviceRecord) -> bool {
        self.send(record.clone()).is_ok()
    }
}

/// Called with each record discovered on a platform
pub type DiscoveryCallback = Box<dyn FnMut(&DeviceRecord) + Send>;

/// Insertion-ordered records of one platform
#[derive(Debug, Default)]
struct PlatformBucket {
    order: Vec<UniqueId>,
    records: HashMap<UniqueId, DeviceRecord>,
}

impl PlatformBucket {
    fn upsert(&mut self, unique_id: UniqueId, record: DeviceRecord) {
        if self.records.insert(unique_id.clone(), record).is_none() {
            self.order.push(unique_id);
        }
    }

    fn visible(&self) -> Vec<DeviceRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|record| !record.is_hidden())
            .cloned()
            .collect()
    }
}

/// Counts from one merged batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Records written to the entity map (roots and children)
    pub merged: usize,
    /// Records forwarded to a registered entity
    pub notified: usize,
    /// Records handed to discovery callbacks
    pub discovered: usize,
}

pub struct DeviceTree {
    gateway_id: String,
    entities: BTreeMap<UniqueId, DeviceRecord>,
    platforms: HashMap<Platform, PlatformBucket>,
    health: HashMap<i64, i64>,
    registered: HashMap<UniqueId, Arc<dyn EntityListener>>,
    discovery: HashMap<Platform, Vec<DiscoveryCallback>>,
}

impl DeviceTree {
    #[must_use]
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            entities: BTreeMap::new(),
            platforms: HashMap::new(),
            health: HashMap::new(),
            registered: HashMap::new(),
            discovery: HashMap::new(),
        }
    }

    #[must_use]
    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Merge one `update` batch.
    ///
    /// Devices are merged in ascending pk order, each followed by its
    /// children in ascending pk order.
    pub fn apply_update(&mut self, mut devices: Vec<DeviceRecord>) -> MergeStats {
        devices.sort_by_key(|device| device.pk);
        debug!("[{}] Handle {} devices", self.gateway_id, devices.len());

        let mut stats = MergeStats::default();
        for device in devices {
            let pk = device.pk;
            let lct = device.lct;
            self.merge_device(device, &mut stats);
            self.health.insert(pk, lct);
        }
        stats
    }

    /// Re-merge a previously persisted entity map.
    ///
    /// Records are merged as stored; the health map is left untouched so the
    /// next health ping refreshes every device.
    pub fn hydrate(&mut self, persisted: Value) -> usize {
        let stored: BTreeMap<UniqueId, DeviceRecord> = match serde_json::from_value(persisted) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("[{}] Ignoring unreadable device map: {e}", self.gateway_id);
                return 0;
            }
        };

        let count = stored.len();
        let mut stats = MergeStats::default();
        for record in stored.into_values() {
            self.merge_device(record, &mut stats);
        }
        debug!("[{}] Restored {count} stored records", self.gateway_id);
        count
    }

    fn merge_device(&mut self, mut device: DeviceRecord, stats: &mut MergeStats) {
        device.normalize_children();

        let parent_id = device.unique_id(&self.gateway_id);
        for child in &mut device.children {
            child.parent_unique_id = Some(parent_id.clone());
        }

        let children = device.children.clone();
        self.merge_record(device, stats);
        for child in children {
            self.merge_record(child, stats);
        }
    }

    fn merge_record(&mut self, record: DeviceRecord, stats: &mut MergeStats) {
        let unique_id = record.unique_id(&self.gateway_id);
        stats.merged += 1;

        if let Some(entity) = self.registered.get(&unique_id) {
            if entity.record_updated(&record) {
                self.entities.insert(unique_id, record);
                stats.notified += 1;
                return;
            }
            debug!("Entity {unique_id} went away, unregistering");
            self.registered.remove(&unique_id);
        }

        let platform = record.platform();
        self.entities.insert(unique_id.clone(), record.clone());

        let Some(platform) = platform else {
            return;
        };

        self.platforms
            .entry(platform)
            .or_default()
            .upsert(unique_id, record.clone());

        if let Some(callbacks) = self.discovery.get_mut(&platform) {
            for callback in callbacks.iter_mut() {
                callback(&record);
            }
            stats.discovered += 1;
        }
    }

    /// Device pks whose reported lct differs from the last merged one, ascending.
    #[must_use]
    pub fn diff_health(&self, report: &BTreeMap<i64, i64>) -> Vec<i64> {
        report
            .iter()
            .filter(|(pk, lct)| self.health.get(pk).copied().unwrap_or(0) != **lct)
            .map(|(pk, _)| *pk)
            .collect()
    }

    pub fn register_entity(&mut self, unique_id: UniqueId, entity: Arc<dyn EntityListener>) {
        debug!("[{}] Registered entity {unique_id}", self.gateway_id);
        self.registered.insert(unique_id, entity);
    }

    pub fn register_platform_listener(&mut self, platform: Platform, callback: DiscoveryCallback) {
        self.discovery.entry(platform).or_default().push(callback);
    }

    #[must_use]
    pub fn get_entity(&self, unique_id: &str) -> Option<&DeviceRecord> {
        self.entities.get(unique_id)
    }

    #[must_use]
    pub fn platform_snapshot(&self, platform: Platform) -> Vec<DeviceRecord> {
        self.platforms
            .get(&platform)
            .map(PlatformBucket::visible)
            .unwrap_or_default()
    }

    /// Root pks currently present in the entity map
    #[must_use]
    pub fn root_pks(&self) -> Vec<i64> {
        let mut pks: Vec<i64> = self
            .entities
            .values()
            .filter(|record| !record.is_child())
            .map(|record| record.pk)
            .collect();
        pks.sort_unstable();
        pks.dedup();
        pks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[must_use]
    pub fn health_of(&self, pk: i64) -> Option<i64> {
        self.health.get(&pk).copied()
    }

    /// The entity map in its persisted form
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.entities).unwrap_or(Value::Null)
    }
}
