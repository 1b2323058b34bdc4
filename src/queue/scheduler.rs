//! Queue scheduler: claim, release and flag operations on benchmark entries.
//!
//! Every method is one call into the [`EntryStore`]; the scheduler itself is
//! stateless and can be shared freely between workers or restarted at any
//! point.

use chrono::Utc;

use crate::error::{PerflabError, Result};
use crate::queue::entry::{
    ConfigUpdate, EnabledStatus, EntryId, FlagAssignment, NewConfig, QueueEntry, RepeatStatus,
};
use crate::queue::filter::EntryFilter;
use crate::queue::store::{Condition, EntryOrder, EntryStore, EntryUpdate, Selector};

pub struct QueueScheduler<S: EntryStore> {
    store: S,
}

impl<S: EntryStore> QueueScheduler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enable or disable an entry. Disabling also switches off auto-repeat.
    pub fn set_enabled(&self, id: &EntryId, enabled: bool) -> Result<()> {
        let update = EntryUpdate::new().flags(FlagAssignment::set_enabled(enabled));
        self.update_by_id(id, &update)?;
        tracing::info!(entry_id = %id, enabled, "Queue entry enabled flag set");
        Ok(())
    }

    /// A missing entry reads as disabled.
    pub fn get_enabled(&self, id: &EntryId) -> Result<EnabledStatus> {
        let enabled = self
            .store
            .get(id)?
            .map(|e| e.queue.flags.enabled())
            .unwrap_or(false);
        Ok(EnabledStatus { enabled })
    }

    /// Set auto-repeat. The entry is enabled at the same time.
    pub fn set_repeat(&self, id: &EntryId, repeat: bool) -> Result<()> {
        let update = EntryUpdate::new().flags(FlagAssignment::set_repeat(repeat));
        self.update_by_id(id, &update)?;
        tracing::info!(entry_id = %id, repeat, "Queue entry repeat flag set");
        Ok(())
    }

    /// A missing entry reads as non-repeating.
    pub fn get_repeat(&self, id: &EntryId) -> Result<RepeatStatus> {
        let repeat = self
            .store
            .get(id)?
            .map(|e| e.queue.flags.repeat())
            .unwrap_or(false);
        Ok(RepeatStatus { repeat })
    }

    pub fn set_priority(&self, id: &EntryId, priority: i64) -> Result<()> {
        self.update_by_id(id, &EntryUpdate::new().priority(priority))?;
        tracing::info!(entry_id = %id, priority, "Queue entry priority set");
        Ok(())
    }

    pub fn set_state_label(&self, id: &EntryId, label: &str) -> Result<()> {
        self.update_by_id(id, &EntryUpdate::new().state_label(label))
    }

    /// Atomically claim the best eligible entry matching `filter`.
    ///
    /// Eligible means not running, enabled and not archived. Among those the
    /// highest priority wins, then the one completed longest ago (never
    /// completed first). The claimed entry is marked running with
    /// `started = now`, and its state from before the claim is returned.
    /// `None` means nothing is eligible right now, including the case where
    /// another worker won the race.
    pub fn claim_next(&self, filter: &EntryFilter) -> Result<Option<QueueEntry>> {
        let selector = Selector::matching(filter.clone())
            .and(Condition::NotRunning)
            .and(Condition::Enabled)
            .and(Condition::NotArchived);
        let update = EntryUpdate::new().running(true).started(Utc::now());
        let claimed = self.store.find_one_and_update(
            &selector,
            &update,
            EntryOrder::PriorityThenOldestCompleted,
        )?;
        match claimed {
            Some(ref entry) => {
                tracing::info!(
                    entry_id = %entry.id,
                    name = %entry.name,
                    priority = entry.queue.priority,
                    "Queue entry claimed"
                );
            }
            None => tracing::debug!(filter = ?filter, "No claimable queue entry"),
        }
        Ok(claimed)
    }

    /// Mark every running entry matching `filter` as stopped, leaving
    /// `completed` and `priority` untouched. Used for crash recovery.
    pub fn release_all(&self, filter: &EntryFilter) -> Result<u64> {
        let selector = Selector::matching(filter.clone()).and(Condition::Running);
        let released = self
            .store
            .update_many(&selector, &EntryUpdate::new().running(false))?;
        tracing::info!(released, filter = ?filter, "Released running queue entries");
        Ok(released)
    }

    /// Finish a claim: stop running, reset priority to 0 and record
    /// `completed = now`, which moves the entry to the back of its tier.
    pub fn mark_done(&self, id: &EntryId) -> Result<()> {
        let update = EntryUpdate::new()
            .running(false)
            .priority(0)
            .completed(Utc::now());
        self.update_by_id(id, &update)?;
        tracing::info!(entry_id = %id, "Queue entry done");
        Ok(())
    }

    /// Disable the entry only if it is not set to auto-repeat, as one
    /// conditional update. Returns the pre-update entry when it was disabled,
    /// `None` when it repeats or does not exist.
    pub fn disable_oneshot(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        let selector = Selector::by_id(*id).and(Condition::NotRepeat);
        let update = EntryUpdate::new().flags(FlagAssignment::set_enabled(false));
        let disabled = self
            .store
            .find_one_and_update(&selector, &update, EntryOrder::Unordered)?;
        if disabled.is_some() {
            tracing::info!(entry_id = %id, "One-shot queue entry disabled");
        }
        Ok(disabled)
    }

    /// Hand a claimed entry back: `disable_oneshot`, then `mark_done`, then
    /// the state label. `mark_done` is attempted even if disabling failed so
    /// the entry is never left running; the first error is returned.
    pub fn finish_claim(&self, id: &EntryId, label: &str) -> Result<()> {
        let disabled = self.disable_oneshot(id);
        let done = self.mark_done(id);
        if let Err(ref e) = disabled {
            tracing::warn!(entry_id = %id, error = %e, "Failed to disable one-shot entry");
        }
        disabled?;
        done?;
        self.set_state_label(id, label)
    }

    fn update_by_id(&self, id: &EntryId, update: &EntryUpdate) -> Result<()> {
        self.store
            .find_one_and_update(&Selector::by_id(*id), update, EntryOrder::Unordered)?
            .map(|_| ())
            .ok_or(PerflabError::EntryNotFound(*id))
    }
}

/// Configuration lifecycle around the queue entries.
impl<S: EntryStore> QueueScheduler<S> {
    /// Store a new configuration, queued with `{enabled, repeat, priority 0}`.
    pub fn insert_config(&self, config: NewConfig) -> Result<QueueEntry> {
        let entry = QueueEntry::new(config);
        self.store.insert(entry.clone())?;
        tracing::info!(entry_id = %entry.id, name = %entry.name, kind = %entry.kind, "Configuration added");
        Ok(entry)
    }

    pub fn get_entry(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        self.store.get(id)
    }

    pub fn list_entries(&self) -> Result<Vec<QueueEntry>> {
        self.store.list()
    }

    /// Change the descriptive fields of a configuration and bump `updated`.
    /// `created` and the queue state are never touched. Returns the entry as
    /// stored after the change.
    pub fn update_config(&self, id: &EntryId, config: ConfigUpdate) -> Result<QueueEntry> {
        let update = EntryUpdate::new().describe(config, Utc::now());
        self.update_by_id(id, &update)?;
        let entry = self
            .store
            .get(id)?
            .ok_or(PerflabError::EntryNotFound(*id))?;
        tracing::info!(entry_id = %id, name = %entry.name, "Configuration updated");
        Ok(entry)
    }

    /// Remove the listed configurations. Their runs and samples live in the
    /// run store and are removed by the caller.
    pub fn delete_configs(&self, ids: &[EntryId]) -> Result<u64> {
        let selector = Selector::matching(EntryFilter::all().with_ids(ids.to_vec()));
        let deleted = self.store.delete_many(&selector)?;
        tracing::info!(deleted, "Configurations deleted");
        Ok(deleted)
    }

    /// Archive all listed configurations in one bulk update.
    pub fn archive(&self, ids: &[EntryId]) -> Result<u64> {
        let selector = Selector::matching(EntryFilter::all().with_ids(ids.to_vec()));
        let archived = self
            .store
            .update_many(&selector, &EntryUpdate::new().archive(Utc::now()))?;
        tracing::info!(archived, "Configurations archived");
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryEntryStore;

    fn scheduler() -> QueueScheduler<MemoryEntryStore> {
        QueueScheduler::new(MemoryEntryStore::new())
    }

    #[test]
    fn missing_entry_reads_as_off() {
        let s = scheduler();
        let id = uuid::Uuid::new_v4();
        assert!(!s.get_enabled(&id).unwrap().enabled);
        assert!(!s.get_repeat(&id).unwrap().repeat);
    }

    #[test]
    fn writes_to_missing_entry_are_not_found() {
        let s = scheduler();
        let id = uuid::Uuid::new_v4();
        assert!(matches!(
            s.set_enabled(&id, true),
            Err(PerflabError::EntryNotFound(_))
        ));
        assert!(matches!(s.mark_done(&id), Err(PerflabError::EntryNotFound(_))));
        assert!(s.disable_oneshot(&id).unwrap().is_none());
    }

    #[test]
    fn claim_returns_pre_update_entry() {
        let s = scheduler();
        let entry = s.insert_config(NewConfig::new("a", "bind", "true")).unwrap();
        let claimed = s.claim_next(&EntryFilter::all()).unwrap().unwrap();
        assert_eq!(claimed.id, entry.id);
        assert!(!claimed.queue.running);
        assert!(claimed.queue.started.is_none());

        let stored = s.get_entry(&entry.id).unwrap().unwrap();
        assert!(stored.queue.running);
        assert!(stored.queue.started.is_some());
    }

    #[test]
    fn finish_claim_releases_and_labels() {
        let s = scheduler();
        let entry = s.insert_config(NewConfig::new("a", "bind", "true")).unwrap();
        s.claim_next(&EntryFilter::all()).unwrap().unwrap();
        s.finish_claim(&entry.id, "idle").unwrap();

        let stored = s.get_entry(&entry.id).unwrap().unwrap();
        assert!(!stored.queue.running);
        assert!(stored.queue.completed.is_some());
        assert_eq!(stored.queue.state.as_deref(), Some("idle"));
        assert!(matches!(
            s.finish_claim(&uuid::Uuid::new_v4(), "idle"),
            Err(PerflabError::EntryNotFound(_))
        ));
    }

    #[test]
    fn update_config_keeps_created_and_queue() {
        let s = scheduler();
        let entry = s.insert_config(NewConfig::new("a", "bind", "echo 1")).unwrap();
        s.set_priority(&entry.id, 4).unwrap();

        let update = ConfigUpdate {
            command: Some("echo 2".to_string()),
            ..Default::default()
        };
        let updated = s.update_config(&entry.id, update).unwrap();
        assert_eq!(updated.name, "a");
        assert_eq!(updated.command, "echo 2");
        assert_eq!(updated.created, entry.created);
        assert!(updated.updated >= entry.updated);
        assert_eq!(updated.queue.priority, 4);
        assert_eq!(s.get_entry(&entry.id).unwrap().unwrap(), updated);
    }

    #[test]
    fn state_label_has_no_scheduling_effect() {
        let s = scheduler();
        let entry = s.insert_config(NewConfig::new("a", "bind", "true")).unwrap();
        s.set_state_label(&entry.id, "building").unwrap();
        let stored = s.get_entry(&entry.id).unwrap().unwrap();
        assert_eq!(stored.queue.state.as_deref(), Some("building"));
        assert!(s.claim_next(&EntryFilter::all()).unwrap().is_some());
    }
}
