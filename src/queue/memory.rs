use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{lock_poisoned, Result};
use crate::queue::entry::{EntryId, QueueEntry};
use crate::queue::store::{EntryOrder, EntryStore, EntryUpdate, Selector};

/// In-process entry store. A single mutex makes every operation atomic with
/// respect to every other one on the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryEntryStore {
    entries: Arc<Mutex<HashMap<EntryId, QueueEntry>>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntryStore for MemoryEntryStore {
    fn insert(&self, entry: QueueEntry) -> Result<()> {
        let mut entries = self.entries.lock().map_err(lock_poisoned)?;
        entries.insert(entry.id, entry);
        Ok(())
    }

    fn get(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        let entries = self.entries.lock().map_err(lock_poisoned)?;
        Ok(entries.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<QueueEntry>> {
        let entries = self.entries.lock().map_err(lock_poisoned)?;
        let mut all: Vec<QueueEntry> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    fn find_one_and_update(
        &self,
        selector: &Selector,
        update: &EntryUpdate,
        order: EntryOrder,
    ) -> Result<Option<QueueEntry>> {
        let mut entries = self.entries.lock().map_err(lock_poisoned)?;
        let chosen = entries
            .values()
            .filter(|e| selector.matches(e))
            .min_by(|a, b| order.compare(a, b))
            .map(|e| e.id);

        let Some(id) = chosen else {
            return Ok(None);
        };
        let Some(entry) = entries.get_mut(&id) else {
            return Ok(None);
        };
        let previous = entry.clone();
        update.apply(entry);
        Ok(Some(previous))
    }

    fn update_many(&self, selector: &Selector, update: &EntryUpdate) -> Result<u64> {
        let mut entries = self.entries.lock().map_err(lock_poisoned)?;
        let mut matched = 0;
        for entry in entries.values_mut().filter(|e| selector.matches(e)) {
            update.apply(entry);
            matched += 1;
        }
        Ok(matched)
    }

    fn delete_many(&self, selector: &Selector) -> Result<u64> {
        let mut entries = self.entries.lock().map_err(lock_poisoned)?;
        let before = entries.len();
        entries.retain(|_, e| !selector.matches(e));
        Ok((before - entries.len()) as u64)
    }
}
