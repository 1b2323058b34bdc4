use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::RunnerConfig;
use crate::error::{PerflabError, Result};
use crate::queue::{EntryId, QueueEntry};

/// Produces one sample value for a queue entry.
pub trait BenchmarkRunner: Send + Sync + 'static {
    fn run_sample(&self, entry: &QueueEntry) -> impl Future<Output = Result<f64>> + Send;
}

/// Runs the entry's command through a shell and reads the sample value from
/// the last non-empty line of stdout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub async fn execute(&self, entry_id: EntryId, command: &str) -> Result<f64> {
        tracing::debug!(entry_id = %entry_id, command, shell = %self.config.shell, "Running benchmark command");

        let child = Command::new(&self.config.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, child).await {
            Ok(result) => Self::process_output(entry_id, result),
            Err(_) => {
                tracing::warn!(entry_id = %entry_id, timeout_ms = self.config.timeout_ms, "Benchmark command timed out");
                Err(PerflabError::Runner(format!(
                    "command timed out after {}ms",
                    self.config.timeout_ms
                )))
            }
        }
    }

    fn process_output(
        entry_id: EntryId,
        result: std::result::Result<std::process::Output, std::io::Error>,
    ) -> Result<f64> {
        let output = result.map_err(|e| {
            tracing::error!(entry_id = %entry_id, error = %e, "Benchmark command failed to start");
            PerflabError::Runner(e.to_string())
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let exit_code = output.status.code();
            tracing::warn!(entry_id = %entry_id, exit_code = ?exit_code, "Benchmark command failed");
            return Err(PerflabError::Runner(if stderr.trim().is_empty() {
                format!("exit code: {:?}", exit_code)
            } else {
                stderr.trim().to_string()
            }));
        }

        parse_sample(&stdout)
    }
}

impl BenchmarkRunner for CommandRunner {
    async fn run_sample(&self, entry: &QueueEntry) -> Result<f64> {
        self.execute(entry.id, &entry.command).await
    }
}

/// The last non-empty line of `stdout`, parsed as a number.
pub fn parse_sample(stdout: &str) -> Result<f64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .ok_or_else(|| PerflabError::Runner("command produced no output".to_string()))?;
    let value: f64 = line
        .parse()
        .map_err(|_| PerflabError::Runner(format!("not a number: {:?}", line)))?;
    if !value.is_finite() {
        return Err(PerflabError::Runner(format!("not a finite number: {}", line)));
    }
    Ok(value)
}
