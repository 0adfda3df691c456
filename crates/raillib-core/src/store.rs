//! Persisted entity store interface.
//!
//! The storage engine itself is outside raillib. The dispatcher only needs
//! find-by-key and persist operations, called sequentially from a single
//! task, with last-write-wins semantics per key. [`InMemoryStore`] is a
//! complete in-process implementation used for tests and embedding.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::Result;
use crate::types::{Accessory, DecoderType, Locomotive, Sensor};

/// Find/persist access to the persisted inventory.
pub trait EntityStore: Send + Sync {
    /// Find a locomotive record by id.
    fn find_locomotive(&self, id: &str) -> Result<Option<Locomotive>>;

    /// Find a locomotive record by decoder address and protocol.
    fn find_locomotive_by_address(
        &self,
        address: u32,
        decoder_type: DecoderType,
    ) -> Result<Option<Locomotive>>;

    /// Insert or replace a locomotive record. Returns the record id; an
    /// empty id asks the store to assign one.
    fn persist_locomotive(&self, locomotive: &Locomotive) -> Result<String>;

    /// Find an accessory record by id.
    fn find_accessory(&self, id: &str) -> Result<Option<Accessory>>;

    /// Find an accessory record by its primary decoder address.
    fn find_accessory_by_address(&self, address: u32) -> Result<Option<Accessory>>;

    /// Insert or replace an accessory record. Returns the record id.
    fn persist_accessory(&self, accessory: &Accessory) -> Result<String>;

    /// Find a sensor record by feedback module and 1-based port.
    fn find_sensor(&self, device_id: u32, contact_id: u16) -> Result<Option<Sensor>>;

    /// Insert or replace a sensor record. Returns the record id.
    fn persist_sensor(&self, sensor: &Sensor) -> Result<String>;
}

#[derive(Debug, Default)]
struct Tables {
    locomotives: BTreeMap<String, Locomotive>,
    accessories: BTreeMap<String, Accessory>,
    sensors: BTreeMap<String, Sensor>,
    next_id: u64,
    writes: usize,
}

impl Tables {
    fn assign_id(&mut self, id: &str) -> String {
        if id.is_empty() {
            self.next_id += 1;
            format!("rec-{}", self.next_id)
        } else {
            id.to_string()
        }
    }
}

/// An [`EntityStore`] kept entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persist calls made so far.
    pub fn writes(&self) -> usize {
        self.tables.read().writes
    }

    /// All locomotive records, ordered by id.
    pub fn locomotives(&self) -> Vec<Locomotive> {
        self.tables.read().locomotives.values().cloned().collect()
    }

    /// All accessory records, ordered by id.
    pub fn accessories(&self) -> Vec<Accessory> {
        self.tables.read().accessories.values().cloned().collect()
    }

    /// All sensor records, ordered by id.
    pub fn sensors(&self) -> Vec<Sensor> {
        self.tables.read().sensors.values().cloned().collect()
    }
}

impl EntityStore for InMemoryStore {
    fn find_locomotive(&self, id: &str) -> Result<Option<Locomotive>> {
        Ok(self.tables.read().locomotives.get(id).cloned())
    }

    fn find_locomotive_by_address(
        &self,
        address: u32,
        decoder_type: DecoderType,
    ) -> Result<Option<Locomotive>> {
        Ok(self
            .tables
            .read()
            .locomotives
            .values()
            .find(|l| l.address == address && l.decoder_type == decoder_type)
            .cloned())
    }

    fn persist_locomotive(&self, locomotive: &Locomotive) -> Result<String> {
        let mut t = self.tables.write();
        let id = t.assign_id(&locomotive.id);
        let mut record = locomotive.clone();
        record.id = id.clone();
        t.locomotives.insert(id.clone(), record);
        t.writes += 1;
        Ok(id)
    }

    fn find_accessory(&self, id: &str) -> Result<Option<Accessory>> {
        Ok(self.tables.read().accessories.get(id).cloned())
    }

    fn find_accessory_by_address(&self, address: u32) -> Result<Option<Accessory>> {
        Ok(self
            .tables
            .read()
            .accessories
            .values()
            .find(|a| a.address == address)
            .cloned())
    }

    fn persist_accessory(&self, accessory: &Accessory) -> Result<String> {
        let mut t = self.tables.write();
        let id = t.assign_id(&accessory.id);
        let mut record = accessory.clone();
        record.id = id.clone();
        t.accessories.insert(id.clone(), record);
        t.writes += 1;
        Ok(id)
    }

    fn find_sensor(&self, device_id: u32, contact_id: u16) -> Result<Option<Sensor>> {
        Ok(self
            .tables
            .read()
            .sensors
            .values()
            .find(|s| s.device_id == device_id && s.contact_id == contact_id)
            .cloned())
    }

    fn persist_sensor(&self, sensor: &Sensor) -> Result<String> {
        let mut t = self.tables.write();
        let id = t.assign_id(&sensor.id);
        let mut record = sensor.clone();
        record.id = id.clone();
        t.sensors.insert(id.clone(), record);
        t.writes += 1;
        Ok(id)
    }
}
