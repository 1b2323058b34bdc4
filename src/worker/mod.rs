//! Benchmark workers.
//!
//! Each worker repeatedly claims the next queue entry, runs its command
//! `samples_per_run` times, stores the samples and the run statistics, and
//! then hands the entry back to the queue:
//!
//! 1. Skip while the global pause switch is on
//! 2. [`QueueScheduler::claim_next`](crate::queue::QueueScheduler::claim_next)
//! 3. Insert a run and one sample per execution
//! 4. Recompute the run statistics
//! 5. `disable_oneshot`, then `mark_done`
//!
//! A failed run still goes through step 5 so the entry never stays claimed.
//! Store calls run on the blocking pool through [`Services::blocking`].

pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::daemon::Services;
use crate::error::Result;
use crate::queue::{EntryId, QueueEntry};
use crate::stats::RunStats;
use crate::store::{Run, RunId, Sample};

pub use runner::{BenchmarkRunner, CommandRunner};

/// What a single poll did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Paused,
    Idle,
    Completed {
        entry_id: EntryId,
        run_id: RunId,
        stats: RunStats,
    },
    Failed {
        entry_id: EntryId,
        error: String,
    },
}

pub struct Worker<B: BenchmarkRunner> {
    id: usize,
    services: Services,
    runner: Arc<B>,
    config: WorkerConfig,
}

impl<B: BenchmarkRunner> Worker<B> {
    pub fn new(id: usize, services: Services, runner: Arc<B>, config: WorkerConfig) -> Self {
        Self {
            id,
            services,
            runner,
            config,
        }
    }

    /// Poll until `token` is cancelled. A run in progress is finished first.
    pub async fn run(self, token: CancellationToken) {
        tracing::info!(worker_id = self.id, filter = ?self.config.filter, "Worker started");

        loop {
            if token.is_cancelled() {
                break;
            }

            let wait = match self.poll_once().await {
                Ok(PollOutcome::Completed { .. }) | Ok(PollOutcome::Failed { .. }) => None,
                Ok(PollOutcome::Paused) | Ok(PollOutcome::Idle) => Some(jittered_interval(
                    self.config.poll_interval_ms,
                    self.config.poll_jitter_ms,
                )),
                Err(e) => {
                    tracing::error!(worker_id = self.id, error = %e, "Worker poll failed");
                    Some(Duration::from_millis(self.config.poll_interval_ms))
                }
            };

            if let Some(wait) = wait {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        tracing::info!(worker_id = self.id, "Worker stopped");
    }

    /// Claim and process at most one entry.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let services = &self.services;
        if services.blocking(|s| s.stores.control.get_paused()).await?.paused {
            return Ok(PollOutcome::Paused);
        }

        let filter = self.config.filter.clone();
        let claimed = services
            .blocking(move |s| s.scheduler.claim_next(&filter))
            .await?;
        let Some(entry) = claimed else {
            return Ok(PollOutcome::Idle);
        };

        let (outcome, label) = match self.run_entry(&entry).await {
            Ok((run_id, stats)) => (
                PollOutcome::Completed {
                    entry_id: entry.id,
                    run_id,
                    stats,
                },
                "idle".to_string(),
            ),
            Err(e) => {
                tracing::warn!(worker_id = self.id, entry_id = %entry.id, error = %e, "Benchmark run failed");
                let label = format!("failed: {}", e);
                (
                    PollOutcome::Failed {
                        entry_id: entry.id,
                        error: e.to_string(),
                    },
                    label,
                )
            }
        };

        let entry_id = entry.id;
        services
            .blocking(move |s| s.scheduler.finish_claim(&entry_id, &label))
            .await?;
        Ok(outcome)
    }

    async fn run_entry(&self, entry: &QueueEntry) -> Result<(RunId, RunStats)> {
        let services = &self.services;
        let entry_id = entry.id;
        let run = Run::new(entry_id, self.config.samples_per_run);
        let run_id = run.id;
        services
            .blocking(move |s| {
                s.scheduler.set_state_label(&entry_id, "running")?;
                s.stores.runs.insert_run(run)
            })
            .await?;
        tracing::info!(worker_id = self.id, entry_id = %entry_id, run_id = %run_id, "Run started");

        for iteration in 0..self.config.samples_per_run {
            let value = self.runner.run_sample(entry).await?;
            tracing::debug!(run_id = %run_id, iteration, value, "Sample recorded");
            services
                .blocking(move |s| {
                    s.stores
                        .samples
                        .insert_sample(Sample::new(run_id, entry_id, value))
                })
                .await?;
        }

        let stats = services
            .blocking(move |s| s.stats.update_run_stats(&run_id))
            .await?;
        Ok((run_id, stats))
    }
}

/// `base_ms` plus a uniformly random `0..=jitter_ms`.
pub fn jittered_interval(base_ms: u64, jitter_ms: u64) -> Duration {
    let extra = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    Duration::from_millis(base_ms + extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let d = jittered_interval(100, 50);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
        assert_eq!(jittered_interval(10, 0), Duration::from_millis(10));
    }
}
