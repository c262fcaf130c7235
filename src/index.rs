//! In-memory map from key string to its slot-table location. Rebuilt from
//! the file whenever a vault is opened or compacted; never persisted
//! separately (the slot table plus record headers are its source of
//! truth).

use crate::constants::BOX_KEY_SIZE;
use crate::error::{Result, VaultError};
use crate::format::VaultFile;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    /// Index into the slot table (not a byte offset).
    pub slot_index: u32,
    pub mtime: u64,
    pub type_: u8,
}

#[derive(Default)]
pub struct KeyIndex {
    map: HashMap<String, IndexEntry>,
}

impl KeyIndex {
    pub fn with_capacity(slot_count: u32) -> Self {
        Self { map: HashMap::with_capacity((slot_count / 2).max(1) as usize) }
    }

    /// Scans the slot table front-to-back, stopping at the first
    /// `UNUSED` slot, and reads each `ACTIVE` record's key/mtime/type.
    pub fn build_from_file(file: &mut VaultFile, slot_count: u32) -> Result<Self> {
        let mut index = Self::with_capacity(slot_count);
        for i in 0..slot_count {
            let slot = file.read_slot(i)?;
            if slot.is_unused() {
                break;
            }
            if !slot.is_active() {
                continue;
            }
            let (key, mtime, type_) = crate::record::read_key_header(file, &slot)?;
            if key.len() >= BOX_KEY_SIZE {
                return Err(VaultError::FileCorrupt);
            }
            index.map.insert(key, IndexEntry { slot_index: i, mtime, type_ });
        }
        Ok(index)
    }

    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn insert(&mut self, key: String, entry: IndexEntry) {
        self.map.insert(key, entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<IndexEntry> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(|s| s.as_str())
    }
}
