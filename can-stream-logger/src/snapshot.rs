//! Latest-value store for watched CAN IDs
//!
//! The listener's frame handler is the single writer; the capture task and
//! status queries are readers. Every access goes through one coarse lock, so
//! a reader never sees a record with a new payload but an old timestamp.

use crate::registry::WatchRegistry;
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::sync::Arc;

/// Latest known state of one watched CAN ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// CAN message ID
    pub id: u32,
    /// Description from the registry
    pub description: String,
    /// Last payload, `None` until the first matching frame
    pub payload: Option<Vec<u8>>,
    /// Time of the last update
    pub last_update: Option<Timestamp>,
    /// Set on every update, cleared by edge-triggered consumers
    pub fresh: bool,
}

/// Point-in-time view of every watched ID, in registry order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub timestamp: Timestamp,
    pub values: Vec<Option<Vec<u8>>>,
}

impl SnapshotRow {
    /// Value of the column at `slot`, `None` when never updated
    pub fn value(&self, slot: usize) -> Option<&[u8]> {
        self.values.get(slot).and_then(|value| value.as_deref())
    }
}

/// Lock-protected mapping from watched ID to its latest record
#[derive(Debug)]
pub struct SnapshotStore {
    registry: Arc<WatchRegistry>,
    records: Mutex<Vec<MessageRecord>>,
}

impl SnapshotStore {
    /// One empty, non-fresh record per registered ID
    pub fn new(registry: Arc<WatchRegistry>) -> Self {
        let records = registry
            .entries()
            .iter()
            .map(|entry| MessageRecord {
                id: entry.id,
                description: entry.desc.clone(),
                payload: None,
                last_update: None,
                fresh: false,
            })
            .collect();

        Self {
            registry,
            records: Mutex::new(records),
        }
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    /// Overwrite the record of `id`; frames for unregistered IDs are dropped
    ///
    /// Returns `true` when a record was updated.
    pub fn update(&self, id: u32, payload: &[u8], timestamp: Timestamp) -> bool {
        let Some(slot) = self.registry.slot(id) else {
            log::trace!("Skipping CAN message 0x{:X} (not watched)", id);
            return false;
        };

        let mut records = self.records.lock();
        let record = &mut records[slot];
        record.payload = Some(payload.to_vec());
        record.last_update = Some(timestamp);
        record.fresh = true;
        true
    }

    /// Current value of every registered ID; leaves `fresh` untouched
    pub fn snapshot(&self, timestamp: Timestamp) -> SnapshotRow {
        let records = self.records.lock();
        SnapshotRow {
            timestamp,
            values: records.iter().map(|record| record.payload.clone()).collect(),
        }
    }

    /// Clear the fresh flag of `id`, returning its previous value
    pub fn clear_fresh(&self, id: u32) -> bool {
        let Some(slot) = self.registry.slot(id) else {
            return false;
        };
        let mut records = self.records.lock();
        std::mem::replace(&mut records[slot].fresh, false)
    }

    /// Copy of the record of `id`
    pub fn record(&self, id: u32) -> Option<MessageRecord> {
        let slot = self.registry.slot(id)?;
        Some(self.records.lock()[slot].clone())
    }

    /// Copy of every record, in registry order
    pub fn records(&self) -> Vec<MessageRecord> {
        self.records.lock().clone()
    }

    /// Number of IDs updated since their fresh flag was last cleared
    pub fn fresh_count(&self) -> usize {
        self.records.lock().iter().filter(|record| record.fresh).count()
    }
}
