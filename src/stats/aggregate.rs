//! Combinable run statistics.
//!
//! Each retained sample becomes a [`PartialAggregate`]; partials merge with
//! Chan's pairwise update, so any grouping of the samples (serial fold,
//! chunked parallel reduce) gives the same mean and variance up to rounding.
//!
//! The first sample of a multi-sample run is a warm-up measurement and is
//! left out of the math, but still counted in the reported run size.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Below this many retained samples the serial fold is used.
pub const PARALLEL_THRESHOLD: usize = 16_384;

const PARALLEL_CHUNK: usize = 4_096;

/// Summary of a subset of samples that can be merged with any other subset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartialAggregate {
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
    /// Sum of squared deviations from the subset mean.
    pub m2: f64,
}

impl PartialAggregate {
    pub fn from_sample(value: f64) -> Self {
        Self {
            sum: value,
            min: value,
            max: value,
            count: 1,
            m2: 0.0,
        }
    }

    pub fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub fn combine(&self, other: &Self) -> Self {
        let delta = self.mean() - other.mean();
        let weight = (self.count as f64 * other.count as f64) / (self.count + other.count) as f64;
        Self {
            sum: self.sum + other.sum,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            count: self.count + other.count,
            m2: self.m2 + other.m2 + delta * delta * weight,
        }
    }

    /// Fold a slice serially. `None` for an empty slice.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        samples
            .iter()
            .map(|&v| Self::from_sample(v))
            .reduce(|acc, p| acc.combine(&p))
    }
}

/// Merge two optional partials; `None` is the identity.
pub fn merge(a: Option<PartialAggregate>, b: Option<PartialAggregate>) -> Option<PartialAggregate> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.combine(&b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Decides which samples of one run take part in the statistics.
///
/// The counter lives in the filter, so a fresh filter is needed per run.
#[derive(Debug, Clone)]
pub struct WarmupFilter {
    expected_per_run: u32,
    seen: u64,
}

impl WarmupFilter {
    pub fn new(expected_per_run: u32) -> Self {
        Self {
            expected_per_run,
            seen: 0,
        }
    }

    /// Feed the next sample in order; returns whether it is kept.
    pub fn keep(&mut self) -> bool {
        let keep = self.seen > 0 || self.expected_per_run == 1;
        self.seen += 1;
        keep
    }

    /// The retained part of a complete, ordered run.
    pub fn retained<'a>(&self, samples: &'a [f64]) -> &'a [f64] {
        if self.expected_per_run == 1 {
            samples
        } else {
            samples.get(1..).unwrap_or(&[])
        }
    }
}

/// Final statistics for one run.
///
/// `count` is never zero: a run with nothing usable reports `{count: 1}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stddev: Option<f64>,
}

impl RunStats {
    /// Sentinel for a run with no retained samples.
    pub fn empty() -> Self {
        Self {
            count: 1,
            average: None,
            min: None,
            max: None,
            stddev: None,
        }
    }

    pub fn finalize(partial: Option<PartialAggregate>, expected_per_run: u32) -> Self {
        let Some(p) = partial else {
            return Self::empty();
        };

        let stddev = if p.count > 1 {
            Some((p.m2 / (p.count - 1) as f64).sqrt())
        } else {
            None
        };
        // the discarded warm-up sample still counts towards the run size
        let count = if expected_per_run > 1 {
            p.count + 1
        } else {
            p.count
        };

        Self {
            count,
            average: Some(p.mean()),
            min: Some(p.min),
            max: Some(p.max),
            stddev,
        }
    }
}

/// Incremental form for samples that arrive one at a time.
#[derive(Debug, Clone)]
pub struct StatsAccumulator {
    warmup: WarmupFilter,
    expected_per_run: u32,
    partial: Option<PartialAggregate>,
}

impl StatsAccumulator {
    pub fn new(expected_per_run: u32) -> Self {
        Self {
            warmup: WarmupFilter::new(expected_per_run),
            expected_per_run,
            partial: None,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.warmup.keep() {
            self.partial = merge(self.partial, Some(PartialAggregate::from_sample(value)));
        }
    }

    pub fn partial(&self) -> Option<PartialAggregate> {
        self.partial
    }

    pub fn finish(&self) -> RunStats {
        RunStats::finalize(self.partial, self.expected_per_run)
    }
}

/// Statistics for one complete, ordered run.
pub fn aggregate(samples: &[f64], expected_per_run: u32) -> RunStats {
    let retained = WarmupFilter::new(expected_per_run).retained(samples);
    let partial = if retained.len() >= PARALLEL_THRESHOLD {
        reduce_parallel(retained, PARALLEL_CHUNK)
    } else {
        PartialAggregate::from_samples(retained)
    };
    RunStats::finalize(partial, expected_per_run)
}

/// Tree-reduce `samples` on the rayon pool in chunks of `chunk_size`.
pub fn reduce_parallel(samples: &[f64], chunk_size: usize) -> Option<PartialAggregate> {
    samples
        .par_chunks(chunk_size.max(1))
        .map(PartialAggregate::from_samples)
        .reduce(|| None, merge)
}
