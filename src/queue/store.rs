//! Storage contract for queue entries.
//!
//! The scheduler keeps no state of its own. Every transition is a single
//! call into an [`EntryStore`], and mutual exclusion between workers comes
//! entirely from the atomicity of these calls:
//! - `find_one_and_update` must select, modify and return the pre-update
//!   entry as one indivisible step. Two concurrent callers must never both
//!   observe the same entry as matching.
//! - `update_many` must apply the update to every matching entry in one
//!   step, not as a read followed by per-entry writes.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::queue::entry::{ConfigUpdate, EntryId, FlagAssignment, QueueEntry};
use crate::queue::filter::EntryFilter;

/// Predicates on queue state, combined with AND.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Running,
    NotRunning,
    Enabled,
    NotArchived,
    NotRepeat,
}

impl Condition {
    pub fn holds(&self, entry: &QueueEntry) -> bool {
        match self {
            Condition::Running => entry.queue.running,
            Condition::NotRunning => !entry.queue.running,
            Condition::Enabled => entry.queue.flags.enabled(),
            Condition::NotArchived => !entry.archived,
            Condition::NotRepeat => !entry.queue.flags.repeat(),
        }
    }
}

/// Which entries an operation applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub id: Option<EntryId>,
    pub filter: EntryFilter,
    pub conditions: Vec<Condition>,
}

impl Selector {
    pub fn by_id(id: EntryId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn matching(filter: EntryFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn matches(&self, entry: &QueueEntry) -> bool {
        if let Some(id) = self.id {
            if entry.id != id {
                return false;
            }
        }
        self.filter.matches(entry) && self.conditions.iter().all(|c| c.holds(entry))
    }
}

/// Preference among several matching entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrder {
    Unordered,
    /// Highest priority first, then least recently completed, with
    /// never-completed entries ahead of everything else. Creation time and id
    /// break remaining ties so the choice is deterministic.
    PriorityThenOldestCompleted,
}

impl EntryOrder {
    /// `Ordering::Less` means `a` should be picked before `b`.
    pub fn compare(&self, a: &QueueEntry, b: &QueueEntry) -> Ordering {
        match self {
            EntryOrder::Unordered => Ordering::Equal,
            EntryOrder::PriorityThenOldestCompleted => b
                .queue
                .priority
                .cmp(&a.queue.priority)
                .then_with(|| a.queue.completed.cmp(&b.queue.completed))
                .then_with(|| a.created.cmp(&b.created))
                .then_with(|| a.id.cmp(&b.id)),
        }
    }
}

/// Field assignments applied by an update. Unset fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryUpdate {
    flags: Option<FlagAssignment>,
    priority: Option<i64>,
    running: Option<bool>,
    started: Option<DateTime<Utc>>,
    completed: Option<DateTime<Utc>>,
    state_label: Option<String>,
    archived: Option<bool>,
    updated: Option<DateTime<Utc>>,
    config: ConfigUpdate,
}

impl EntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(mut self, assignment: FlagAssignment) -> Self {
        self.flags = Some(assignment);
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn running(mut self, running: bool) -> Self {
        self.running = Some(running);
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started = Some(at);
        self
    }

    pub fn completed(mut self, at: DateTime<Utc>) -> Self {
        self.completed = Some(at);
        self
    }

    pub fn state_label(mut self, label: impl Into<String>) -> Self {
        self.state_label = Some(label.into());
        self
    }

    /// Archive and bump the `updated` timestamp.
    pub fn archive(mut self, at: DateTime<Utc>) -> Self {
        self.archived = Some(true);
        self.updated = Some(at);
        self
    }

    /// Replace descriptive fields and bump the `updated` timestamp.
    pub fn describe(mut self, config: ConfigUpdate, at: DateTime<Utc>) -> Self {
        self.config = config;
        self.updated = Some(at);
        self
    }

    pub fn flag_assignment(&self) -> Option<FlagAssignment> {
        self.flags
    }

    pub fn priority_value(&self) -> Option<i64> {
        self.priority
    }

    pub fn running_value(&self) -> Option<bool> {
        self.running
    }

    pub fn started_value(&self) -> Option<DateTime<Utc>> {
        self.started
    }

    pub fn completed_value(&self) -> Option<DateTime<Utc>> {
        self.completed
    }

    pub fn state_label_value(&self) -> Option<&str> {
        self.state_label.as_deref()
    }

    pub fn archived_value(&self) -> Option<bool> {
        self.archived
    }

    pub fn updated_value(&self) -> Option<DateTime<Utc>> {
        self.updated
    }

    pub fn config_value(&self) -> &ConfigUpdate {
        &self.config
    }

    pub fn apply(&self, entry: &mut QueueEntry) {
        if let Some(assignment) = self.flags {
            entry.queue.flags = entry.queue.flags.apply(assignment);
        }
        if let Some(priority) = self.priority {
            entry.queue.priority = priority;
        }
        if let Some(running) = self.running {
            entry.queue.running = running;
        }
        if let Some(started) = self.started {
            entry.queue.started = Some(started);
        }
        if let Some(completed) = self.completed {
            entry.queue.completed = Some(completed);
        }
        if let Some(ref label) = self.state_label {
            entry.queue.state = Some(label.clone());
        }
        if let Some(archived) = self.archived {
            entry.archived = archived;
        }
        if let Some(updated) = self.updated {
            entry.updated = updated;
        }
        if let Some(ref name) = self.config.name {
            entry.name = name.clone();
        }
        if let Some(ref kind) = self.config.kind {
            entry.kind = kind.clone();
        }
        if let Some(ref command) = self.config.command {
            entry.command = command.clone();
        }
    }
}

/// Durable, concurrency-safe storage of queue entries.
pub trait EntryStore: Send + Sync {
    fn insert(&self, entry: QueueEntry) -> Result<()>;

    fn get(&self, id: &EntryId) -> Result<Option<QueueEntry>>;

    /// All entries, oldest first.
    fn list(&self) -> Result<Vec<QueueEntry>>;

    /// Atomically pick the first entry matching `selector` under `order`,
    /// apply `update` to it and return the entry as it was before the update.
    fn find_one_and_update(
        &self,
        selector: &Selector,
        update: &EntryUpdate,
        order: EntryOrder,
    ) -> Result<Option<QueueEntry>>;

    /// Atomically apply `update` to every matching entry. Returns how many
    /// entries matched.
    fn update_many(&self, selector: &Selector, update: &EntryUpdate) -> Result<u64>;

    /// Remove every matching entry. Returns how many were removed.
    fn delete_many(&self, selector: &Selector) -> Result<u64>;
}

impl<S: EntryStore + ?Sized> EntryStore for Arc<S> {
    fn insert(&self, entry: QueueEntry) -> Result<()> {
        (**self).insert(entry)
    }

    fn get(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        (**self).get(id)
    }

    fn list(&self) -> Result<Vec<QueueEntry>> {
        (**self).list()
    }

    fn find_one_and_update(
        &self,
        selector: &Selector,
        update: &EntryUpdate,
        order: EntryOrder,
    ) -> Result<Option<QueueEntry>> {
        (**self).find_one_and_update(selector, update, order)
    }

    fn update_many(&self, selector: &Selector, update: &EntryUpdate) -> Result<u64> {
        (**self).update_many(selector, update)
    }

    fn delete_many(&self, selector: &Selector) -> Result<u64> {
        (**self).delete_many(selector)
    }
}
