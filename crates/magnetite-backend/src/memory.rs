//! In-memory backend. The default for masters, mandatory for clones.

use std::collections::BTreeMap;

use magnetite_types::{Data, Snapshot, StoreEntry, Timestamp};

use crate::{Backend, BackendError, ops};

/// A `BTreeMap`-backed store with no durability.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: BTreeMap<Data, StoreEntry>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole state, e.g. when a clone installs a snapshot.
    pub fn reset(&mut self, snapshot: Snapshot) {
        self.entries = snapshot;
    }

    fn live(&self, key: &Data, now: Timestamp) -> Option<&StoreEntry> {
        self.entries
            .get(key)
            .filter(|entry| entry.expiry.is_none_or(|at| at > now))
    }
}

impl Backend for MemoryBackend {
    fn put(
        &mut self,
        key: Data,
        value: Data,
        expiry: Option<Timestamp>,
    ) -> Result<(), BackendError> {
        self.entries.insert(key, StoreEntry::new(value, expiry));
        Ok(())
    }

    fn add(
        &mut self,
        key: Data,
        delta: &Data,
        expiry: Option<Timestamp>,
    ) -> Result<(), BackendError> {
        let existing = self.entries.get(&key).map(|e| e.value.clone());
        let combined = ops::add(existing, delta)?;
        self.entries.insert(key, StoreEntry::new(combined, expiry));
        Ok(())
    }

    fn subtract(
        &mut self,
        key: Data,
        delta: &Data,
        expiry: Option<Timestamp>,
    ) -> Result<(), BackendError> {
        let existing = self.entries.get(&key).map(|e| e.value.clone());
        let combined = ops::subtract(existing, delta)?;
        self.entries.insert(key, StoreEntry::new(combined, expiry));
        Ok(())
    }

    fn erase(&mut self, key: &Data) -> Result<(), BackendError> {
        self.entries.remove(key);
        Ok(())
    }

    fn expire(&mut self, key: &Data, now: Timestamp) -> Result<bool, BackendError> {
        let due = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.expiry.is_some_and(|at| at <= now));
        if due {
            self.entries.remove(key);
        }
        Ok(due)
    }

    fn clear(&mut self) -> Result<(), BackendError> {
        self.entries.clear();
        Ok(())
    }

    fn get(&self, key: &Data, now: Timestamp) -> Result<Data, BackendError> {
        self.live(key, now)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| BackendError::NoSuchKey(key.clone()))
    }

    fn exists(&self, key: &Data, now: Timestamp) -> Result<bool, BackendError> {
        Ok(self.live(key, now).is_some())
    }

    fn size(&self, now: Timestamp) -> Result<u64, BackendError> {
        let live = self
            .entries
            .values()
            .filter(|entry| entry.expiry.is_none_or(|at| at > now))
            .count();
        Ok(live as u64)
    }

    fn snapshot(&self, now: Timestamp) -> Result<Snapshot, BackendError> {
        Ok(self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expiry.is_none_or(|at| at > now))
            .map(|(k, entry)| (k.clone(), entry.clone()))
            .collect())
    }
}
