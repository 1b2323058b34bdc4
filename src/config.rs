use std::net::SocketAddr;
use std::path::PathBuf;

use crate::queue::EntryFilter;

/// How benchmark commands are executed.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Shell used as `<shell> -c <command>`
    pub shell: String,
    /// Per-sample wall clock limit
    pub timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout_ms: 600_000,
        }
    }
}

/// Worker loop tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between claim attempts when the queue is empty or paused
    pub poll_interval_ms: u64,
    /// Random extra sleep added to each poll, so idle workers spread out
    pub poll_jitter_ms: u64,
    /// Samples taken per run; the first is discarded as warm-up when > 1
    pub samples_per_run: u32,
    /// Only entries matching this filter are claimed or released
    pub filter: EntryFilter,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            poll_jitter_ms: 250,
            samples_per_run: 5,
            filter: EntryFilter::all(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// SQLite database file; `None` keeps everything in memory
    pub database: Option<PathBuf>,
    /// HTTP API listen address; `None` disables the API
    pub api_addr: Option<SocketAddr>,
    pub workers: usize,
    /// Release entries left running by a previous process before starting
    pub release_on_start: bool,
    pub worker: WorkerConfig,
    pub runner: RunnerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database: None,
            api_addr: None,
            workers: 1,
            release_on_start: true,
            worker: WorkerConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn new(database: Option<PathBuf>) -> Self {
        Self {
            database,
            ..Default::default()
        }
    }

    pub fn with_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_filter(mut self, filter: EntryFilter) -> Self {
        self.worker.filter = filter;
        self
    }
}
