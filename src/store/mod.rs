//! Run, sample and control storage used around the scheduler and the
//! statistics aggregator.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;
use crate::error::Result;
use crate::queue::{EntryId, EntryStore, MemoryEntryStore};
use crate::stats::RunStats;

pub use memory::{MemoryControlStore, MemoryRunStore};
pub use sqlite::{SqliteControlStore, SqliteRunStore};

pub type RunId = Uuid;
pub type SampleId = Uuid;

/// One execution of a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub config_id: EntryId,
    pub samples_per_run: u32,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<RunStats>,
}

impl Run {
    pub fn new(config_id: EntryId, samples_per_run: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            config_id,
            samples_per_run,
            created: now,
            updated: now,
            stats: None,
        }
    }
}

/// A single measurement taken during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: SampleId,
    pub run_id: RunId,
    pub config_id: EntryId,
    pub value: f64,
    pub created: DateTime<Utc>,
}

impl Sample {
    pub fn new(run_id: RunId, config_id: EntryId, value: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            config_id,
            value,
            created: Utc::now(),
        }
    }
}

/// Paging for [`RunStore::runs_for_config`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunQuery {
    pub skip: usize,
    /// Zero means no limit.
    pub limit: usize,
    /// Only runs created at or after this instant.
    pub from: Option<DateTime<Utc>>,
}

impl RunQuery {
    pub fn page(skip: usize, limit: usize) -> Self {
        Self {
            skip,
            limit,
            from: None,
        }
    }

    pub fn since(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn includes(&self, run: &Run) -> bool {
        self.from.map_or(true, |from| run.created >= from)
    }

    /// Apply `skip` and `limit` to runs that already passed the date filter.
    pub fn paginate(&self, runs: Vec<Run>) -> Vec<Run> {
        let limit = if self.limit == 0 { usize::MAX } else { self.limit };
        runs.into_iter().skip(self.skip).take(limit).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PausedStatus {
    pub paused: bool,
}

pub trait SampleStore: Send + Sync {
    fn insert_sample(&self, sample: Sample) -> Result<()>;

    /// Samples of one run ordered by `created`, ties in insertion order.
    fn samples_for_run(&self, run_id: &RunId) -> Result<Vec<Sample>>;
}

pub trait RunStore: Send + Sync {
    fn insert_run(&self, run: Run) -> Result<()>;

    fn get_run(&self, id: &RunId) -> Result<Option<Run>>;

    /// Runs of one configuration, newest first, paged by `query`.
    fn runs_for_config(&self, config_id: &EntryId, query: &RunQuery) -> Result<Vec<Run>>;

    /// Replace the stats of a run. Returns false when the run does not exist.
    fn write_stats(&self, id: &RunId, stats: &RunStats) -> Result<bool>;

    /// Remove every run of the given configurations together with their
    /// samples. Returns how many runs were removed.
    fn delete_runs_for_configs(&self, config_ids: &[EntryId]) -> Result<u64>;
}

/// Global pause switch consulted by workers before claiming.
pub trait ControlStore: Send + Sync {
    fn set_paused(&self, paused: bool) -> Result<()>;

    /// Never having been set reads as not paused.
    fn get_paused(&self) -> Result<PausedStatus>;
}

impl<S: SampleStore + ?Sized> SampleStore for Arc<S> {
    fn insert_sample(&self, sample: Sample) -> Result<()> {
        (**self).insert_sample(sample)
    }

    fn samples_for_run(&self, run_id: &RunId) -> Result<Vec<Sample>> {
        (**self).samples_for_run(run_id)
    }
}

impl<S: RunStore + ?Sized> RunStore for Arc<S> {
    fn insert_run(&self, run: Run) -> Result<()> {
        (**self).insert_run(run)
    }

    fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        (**self).get_run(id)
    }

    fn runs_for_config(&self, config_id: &EntryId, query: &RunQuery) -> Result<Vec<Run>> {
        (**self).runs_for_config(config_id, query)
    }

    fn write_stats(&self, id: &RunId, stats: &RunStats) -> Result<bool> {
        (**self).write_stats(id, stats)
    }

    fn delete_runs_for_configs(&self, config_ids: &[EntryId]) -> Result<u64> {
        (**self).delete_runs_for_configs(config_ids)
    }
}

/// Handles to every store the daemon uses, all backed by the same medium.
#[derive(Clone)]
pub struct Stores {
    pub entries: Arc<dyn EntryStore>,
    pub runs: Arc<dyn RunStore>,
    pub samples: Arc<dyn SampleStore>,
    pub control: Arc<dyn ControlStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let runs = Arc::new(MemoryRunStore::new());
        Self {
            entries: Arc::new(MemoryEntryStore::new()),
            runs: runs.clone(),
            samples: runs,
            control: Arc::new(MemoryControlStore::new()),
        }
    }

    pub fn sqlite(db: &Database) -> Self {
        let runs = Arc::new(db.run_store());
        Self {
            entries: Arc::new(db.entry_store()),
            runs: runs.clone(),
            samples: runs,
            control: Arc::new(db.control_store()),
        }
    }
}
