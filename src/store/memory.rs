use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::error::{lock_poisoned, Result};
use crate::queue::EntryId;
use crate::stats::RunStats;
use crate::store::{
    ControlStore, PausedStatus, Run, RunId, RunQuery, RunStore, Sample, SampleStore,
};

#[derive(Debug, Default)]
struct RunTables {
    runs: HashMap<RunId, Run>,
    /// Append-only, so position is insertion order.
    samples: Vec<Sample>,
}

/// In-process run and sample store.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunStore {
    tables: Arc<Mutex<RunTables>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SampleStore for MemoryRunStore {
    fn insert_sample(&self, sample: Sample) -> Result<()> {
        let mut tables = self.tables.lock().map_err(lock_poisoned)?;
        tables.samples.push(sample);
        Ok(())
    }

    fn samples_for_run(&self, run_id: &RunId) -> Result<Vec<Sample>> {
        let tables = self.tables.lock().map_err(lock_poisoned)?;
        let mut samples: Vec<Sample> = tables
            .samples
            .iter()
            .filter(|s| &s.run_id == run_id)
            .cloned()
            .collect();
        // stable sort keeps insertion order for equal timestamps
        samples.sort_by_key(|s| s.created);
        Ok(samples)
    }
}

impl RunStore for MemoryRunStore {
    fn insert_run(&self, run: Run) -> Result<()> {
        let mut tables = self.tables.lock().map_err(lock_poisoned)?;
        tables.runs.insert(run.id, run);
        Ok(())
    }

    fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        let tables = self.tables.lock().map_err(lock_poisoned)?;
        Ok(tables.runs.get(id).cloned())
    }

    fn runs_for_config(&self, config_id: &EntryId, query: &RunQuery) -> Result<Vec<Run>> {
        let tables = self.tables.lock().map_err(lock_poisoned)?;
        let mut runs: Vec<Run> = tables
            .runs
            .values()
            .filter(|r| &r.config_id == config_id && query.includes(r))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.id.cmp(&a.id)));
        Ok(query.paginate(runs))
    }

    fn write_stats(&self, id: &RunId, stats: &RunStats) -> Result<bool> {
        let mut tables = self.tables.lock().map_err(lock_poisoned)?;
        match tables.runs.get_mut(id) {
            Some(run) => {
                run.stats = Some(stats.clone());
                run.updated = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_runs_for_configs(&self, config_ids: &[EntryId]) -> Result<u64> {
        let mut tables = self.tables.lock().map_err(lock_poisoned)?;
        let before = tables.runs.len();
        tables.runs.retain(|_, r| !config_ids.contains(&r.config_id));
        tables.samples.retain(|s| !config_ids.contains(&s.config_id));
        Ok((before - tables.runs.len()) as u64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryControlStore {
    paused: Arc<AtomicBool>,
}

impl MemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ControlStore for MemoryControlStore {
    fn set_paused(&self, paused: bool) -> Result<()> {
        self.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }

    fn get_paused(&self) -> Result<PausedStatus> {
        Ok(PausedStatus {
            paused: self.paused.load(Ordering::SeqCst),
        })
    }
}
