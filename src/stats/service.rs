use crate::error::{PerflabError, Result};
use crate::stats::aggregate::{aggregate, RunStats};
use crate::store::{RunId, RunStore, SampleStore};

/// Computes a run's statistics from its stored samples and writes them back.
pub struct StatsService<S: SampleStore, R: RunStore> {
    samples: S,
    runs: R,
}

impl<S: SampleStore, R: RunStore> StatsService<S, R> {
    pub fn new(samples: S, runs: R) -> Self {
        Self { samples, runs }
    }

    /// Recompute from scratch and overwrite whatever stats the run had.
    pub fn update_run_stats(&self, run_id: &RunId) -> Result<RunStats> {
        let run = self
            .runs
            .get_run(run_id)?
            .ok_or(PerflabError::RunNotFound(*run_id))?;

        let values: Vec<f64> = self
            .samples
            .samples_for_run(run_id)?
            .into_iter()
            .map(|s| s.value)
            .collect();
        let stats = aggregate(&values, run.samples_per_run);

        if !self.runs.write_stats(run_id, &stats)? {
            return Err(PerflabError::RunNotFound(*run_id));
        }
        tracing::info!(
            run_id = %run_id,
            samples = values.len(),
            count = stats.count,
            average = ?stats.average,
            stddev = ?stats.stddev,
            "Run statistics updated"
        );
        Ok(stats)
    }
}
