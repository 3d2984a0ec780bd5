//! Watched CAN ID registry
//!
//! Built once from the configured watch list. Keeps the first-seen order of
//! the entries, which fixes the column order of every snapshot row.

use crate::config::WatchEntry;
use crate::types::ConfigError;
use std::collections::HashMap;

/// Static mapping between watched CAN IDs and their descriptions
#[derive(Debug, Clone)]
pub struct WatchRegistry {
    /// Entries in configuration order
    entries: Vec<WatchEntry>,
    /// CAN ID -> slot index into `entries`
    slots: HashMap<u32, usize>,
    /// Description -> CAN ID (first entry wins on repeated descriptions)
    by_desc: HashMap<String, u32>,
}

impl WatchRegistry {
    /// Build the registry, rejecting repeated IDs
    ///
    /// An empty list is accepted here; it only becomes an error once a row
    /// format is requested through [`WatchRegistry::columns`].
    pub fn new(entries: Vec<WatchEntry>) -> Result<Self, ConfigError> {
        let mut slots = HashMap::with_capacity(entries.len());
        let mut by_desc = HashMap::with_capacity(entries.len());

        for (index, entry) in entries.iter().enumerate() {
            if slots.insert(entry.id, index).is_some() {
                return Err(ConfigError::DuplicateId(entry.id));
            }
            by_desc.entry(entry.desc.clone()).or_insert(entry.id);
        }

        log::info!(
            "Constructed watched CAN ID table. # of entries: {}",
            entries.len()
        );

        Ok(Self {
            entries,
            slots,
            by_desc,
        })
    }

    /// Convenience constructor from `(id, description)` pairs
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(id, desc)| WatchEntry::new(id, desc))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.slots.contains_key(&id)
    }

    /// Slot index of `id` in snapshot rows
    pub fn slot(&self, id: u32) -> Option<usize> {
        self.slots.get(&id).copied()
    }

    pub fn description(&self, id: u32) -> Option<&str> {
        self.slot(id).map(|index| self.entries[index].desc.as_str())
    }

    pub fn id_for(&self, desc: &str) -> Option<u32> {
        self.by_desc.get(desc).copied()
    }

    /// Entries in snapshot column order
    pub fn entries(&self) -> &[WatchEntry] {
        &self.entries
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|entry| entry.id)
    }

    /// Column header of a snapshot row: `timestamp` followed by the descriptions
    pub fn columns(&self) -> Result<Vec<String>, ConfigError> {
        if self.entries.is_empty() {
            return Err(ConfigError::EmptyRegistry);
        }

        let mut columns = Vec::with_capacity(self.entries.len() + 1);
        columns.push("timestamp".to_string());
        columns.extend(self.entries.iter().map(|entry| entry.desc.clone()));
        Ok(columns)
    }
}
