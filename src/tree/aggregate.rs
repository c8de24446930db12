//! Root-side table of the last data report received from every device.
//!
//! Insertion ordered and append-only: entries are refreshed in place, new
//! devices are appended while capacity remains, and nothing is evicted until
//! an explicit [`AggregationTable::clear`].
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::io::device::DeviceSpecificData;

pub const DEFAULT_MAX_DEVICES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedDevice {
    pub hid: u16,
    pub data: DeviceSpecificData,
    pub last_seen: DateTime<Utc>,
}

impl AggregatedDevice {
    pub fn seconds_since_seen(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_seen).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Updated,
    Inserted,
    /// Unknown device and the table is full; nothing changed.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct AggregationTable {
    entries: Vec<AggregatedDevice>,
    capacity: usize,
}

impl Default for AggregationTable {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_DEVICES)
    }
}

impl AggregationTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn upsert(&mut self, hid: u16, data: DeviceSpecificData) -> Upsert {
        self.upsert_at(hid, data, Utc::now())
    }

    pub fn upsert_at(&mut self, hid: u16, data: DeviceSpecificData, now: DateTime<Utc>) -> Upsert {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.hid == hid) {
            entry.data = data;
            entry.last_seen = now;
            debug!("Updated aggregated data for device {}", hid);
            return Upsert::Updated;
        }
        if self.entries.len() >= self.capacity {
            warn!(
                "Aggregation table full ({} devices); rejecting device {}",
                self.capacity, hid
            );
            return Upsert::Rejected;
        }
        self.entries.push(AggregatedDevice {
            hid,
            data,
            last_seen: now,
        });
        info!(
            "New device added to aggregation: {} (total: {})",
            hid,
            self.entries.len()
        );
        Upsert::Inserted
    }

    pub fn get(&self, hid: u16) -> Option<&AggregatedDevice> {
        self.entries.iter().find(|e| e.hid == hid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AggregatedDevice> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        info!("All aggregated device data cleared");
    }
}
