use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use perflab::config::DaemonConfig;
use perflab::daemon::{Daemon, Services};
use perflab::db::Database;
use perflab::queue::{ConfigUpdate, EntryFilter, NewConfig, QueueEntry};
use perflab::shutdown::install_shutdown_handler;
use perflab::stats::RunStats;
use perflab::store::{Run, RunQuery, Stores};

#[derive(Parser, Debug)]
#[command(name = "perflab")]
#[command(version)]
#[command(about = "Benchmark work queue with run statistics")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the worker pool and HTTP API
    Server(ServerArgs),

    /// Configuration management
    Config {
        #[command(flatten)]
        local: LocalArgs,

        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Queue control
    Queue {
        #[command(flatten)]
        local: LocalArgs,

        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Recompute and show the statistics of a run
    Stats {
        #[command(flatten)]
        local: LocalArgs,

        /// The run ID (UUID)
        run_id: String,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// SQLite database file (in-memory when omitted)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Port for the HTTP API (disabled when omitted)
    #[arg(long)]
    port: Option<u16>,

    /// Number of concurrent workers
    #[arg(long, default_value = "1")]
    workers: usize,

    /// Only claim entries of this kind
    #[arg(long)]
    kind: Option<String>,

    /// Samples taken per run
    #[arg(long, default_value = "5")]
    samples: u32,

    /// Poll interval when the queue is empty or paused
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,

    /// Per-sample command timeout
    #[arg(long, default_value = "600000")]
    timeout_ms: u64,

    /// Keep entries a previous process left running claimed
    #[arg(long)]
    no_release: bool,
}

// =============================================================================
// Local Arguments (shared by admin commands)
// =============================================================================

#[derive(Parser, Debug)]
struct LocalArgs {
    /// SQLite database file
    #[arg(long, default_value = "perflab.db")]
    db: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigCommands {
    /// Add a configuration; it is queued enabled and repeating
    Add {
        name: String,
        /// The benchmark command; its last output line must be a number
        command: String,
        #[arg(long, default_value = "")]
        kind: String,
    },
    /// List all configurations
    List,
    /// Change the name, kind or command of a configuration
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        command: Option<String>,
    },
    /// Delete configurations together with their runs and samples
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
        /// Required; nothing is deleted without it
        #[arg(long)]
        really: bool,
    },
    /// List the runs of a configuration, newest first
    Runs {
        id: String,
        #[arg(long, default_value = "0")]
        skip: usize,
        /// Zero lists every run
        #[arg(long, default_value = "0")]
        limit: usize,
        /// Only runs created at or after this RFC 3339 time
        #[arg(long)]
        from: Option<chrono::DateTime<chrono::Utc>>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum QueueCommands {
    /// Enable an entry
    Enable { id: String },
    /// Disable an entry (also clears repeat)
    Disable { id: String },
    /// Set auto-repeat (also enables)
    Repeat {
        id: String,
        #[arg(action = clap::ArgAction::Set)]
        repeat: bool,
    },
    /// Set the claim priority
    Priority {
        id: String,
        #[arg(allow_negative_numbers = true)]
        priority: i64,
    },
    /// Release every running entry, optionally only those of one kind
    Release {
        #[arg(long)]
        kind: Option<String>,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct QueueUpdateOutput {
    id: String,
    enabled: bool,
    repeat: bool,
    priority: i64,
}

#[derive(Serialize)]
struct ReleaseOutput {
    released: u64,
}

#[derive(Serialize)]
struct StatsOutput {
    run_id: String,
    #[serde(flatten)]
    stats: RunStats,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn open_local(args: &LocalArgs) -> Result<Services, Box<dyn std::error::Error>> {
    let db = Database::open(&args.db)?;
    Ok(Services::new(Stores::sqlite(&db)))
}

fn parse_id(raw: &str) -> Result<uuid::Uuid, Box<dyn std::error::Error>> {
    uuid::Uuid::parse_str(raw.trim()).map_err(|_| format!("Invalid id: {}", raw).into())
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.3}", v))
}

fn print_entry_table(entries: &[QueueEntry]) {
    if entries.is_empty() {
        println!("No configurations found.");
        return;
    }
    println!(
        "{:<38} {:<16} {:<8} {:<8} {:<8} {:<8} STATE",
        "ID", "NAME", "KIND", "ENABLED", "REPEAT", "PRIO"
    );
    println!("{}", "-".repeat(100));
    for entry in entries {
        let name = if entry.name.chars().count() > 16 {
            format!("{}...", entry.name.chars().take(13).collect::<String>())
        } else {
            entry.name.clone()
        };
        let state = if entry.archived {
            "archived".to_string()
        } else if entry.queue.running {
            "running".to_string()
        } else {
            entry.queue.state.clone().unwrap_or_else(|| "-".to_string())
        };
        println!(
            "{:<38} {:<16} {:<8} {:<8} {:<8} {:<8} {}",
            entry.id,
            name,
            entry.kind,
            entry.queue.flags.enabled(),
            entry.queue.flags.repeat(),
            entry.queue.priority,
            state
        );
    }
}

fn print_run_table(runs: &[Run]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }
    println!(
        "{:<38} {:<26} {:<6} {:<10} {:<10}",
        "RUN ID", "CREATED", "COUNT", "AVERAGE", "STDDEV"
    );
    println!("{}", "-".repeat(94));
    for run in runs {
        let (count, average, stddev) = match &run.stats {
            Some(stats) => (stats.count.to_string(), stats.average, stats.stddev),
            None => ("-".to_string(), None, None),
        };
        println!(
            "{:<38} {:<26} {:<6} {:<10} {:<10}",
            run.id,
            run.created.format("%Y-%m-%d %H:%M:%S UTC"),
            count,
            fmt_opt(average),
            fmt_opt(stddev)
        );
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut filter = EntryFilter::all();
    if let Some(kind) = args.kind {
        filter = filter.with_kind(kind);
    }

    let mut config = DaemonConfig::new(args.db)
        .with_workers(args.workers)
        .with_filter(filter);
    if let Some(port) = args.port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        config = config.with_api_addr(addr);
    }
    config.worker.samples_per_run = args.samples;
    config.worker.poll_interval_ms = args.poll_interval_ms;
    config.runner.timeout_ms = args.timeout_ms;
    config.release_on_start = !args.no_release;

    tracing::info!(
        database = ?config.database,
        api_addr = ?config.api_addr,
        workers = config.workers,
        samples_per_run = config.worker.samples_per_run,
        "Starting perflab daemon"
    );

    let token = install_shutdown_handler();
    Daemon::open(config)?.run(token).await?;
    Ok(())
}

// =============================================================================
// Admin Command Handlers
// =============================================================================

fn handle_config(
    services: &Services,
    command: ConfigCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ConfigCommands::Add {
            name,
            command,
            kind,
        } => {
            let entry = services
                .scheduler
                .insert_config(NewConfig::new(name, kind, command))?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entry)?),
                OutputFormat::Table => {
                    println!("Configuration added.");
                    println!("ID: {}", entry.id);
                }
            }
        }
        ConfigCommands::List => {
            let entries = services.scheduler.list_entries()?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                OutputFormat::Table => print_entry_table(&entries),
            }
        }
        ConfigCommands::Update {
            id,
            name,
            kind,
            command,
        } => {
            let id = parse_id(&id)?;
            let entry = services.scheduler.update_config(
                &id,
                ConfigUpdate {
                    name,
                    kind,
                    command,
                },
            )?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entry)?),
                OutputFormat::Table => print_entry_table(std::slice::from_ref(&entry)),
            }
        }
        ConfigCommands::Delete { ids, really } => {
            if !really {
                return Err("Refusing to delete without --really".into());
            }
            let ids = ids
                .iter()
                .map(|id| parse_id(id))
                .collect::<Result<Vec<_>, _>>()?;
            let deleted = services.delete_configs(&ids)?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&deleted)?),
                OutputFormat::Table => println!(
                    "Deleted {} configurations and {} runs.",
                    deleted.configs, deleted.runs
                ),
            }
        }
        ConfigCommands::Runs {
            id,
            skip,
            limit,
            from,
        } => {
            let id = parse_id(&id)?;
            let mut query = RunQuery::page(skip, limit);
            if let Some(from) = from {
                query = query.since(from);
            }
            let runs = services.stores.runs.runs_for_config(&id, &query)?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&runs)?),
                OutputFormat::Table => print_run_table(&runs),
            }
        }
    }
    Ok(())
}

fn handle_queue(
    services: &Services,
    command: QueueCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = &services.scheduler;
    let id = match command {
        QueueCommands::Enable { id } => {
            let id = parse_id(&id)?;
            scheduler.set_enabled(&id, true)?;
            id
        }
        QueueCommands::Disable { id } => {
            let id = parse_id(&id)?;
            scheduler.set_enabled(&id, false)?;
            id
        }
        QueueCommands::Repeat { id, repeat } => {
            let id = parse_id(&id)?;
            scheduler.set_repeat(&id, repeat)?;
            id
        }
        QueueCommands::Priority { id, priority } => {
            let id = parse_id(&id)?;
            scheduler.set_priority(&id, priority)?;
            id
        }
        QueueCommands::Release { kind } => {
            let mut filter = EntryFilter::all();
            if let Some(kind) = kind {
                filter = filter.with_kind(kind);
            }
            let released = scheduler.release_all(&filter)?;
            match output_format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&ReleaseOutput { released })?)
                }
                OutputFormat::Table => println!("Released {} entries.", released),
            }
            return Ok(());
        }
    };

    let entry = scheduler
        .get_entry(&id)?
        .ok_or_else(|| format!("Queue entry not found: {}", id))?;
    let output = QueueUpdateOutput {
        id: entry.id.to_string(),
        enabled: entry.queue.flags.enabled(),
        repeat: entry.queue.flags.repeat(),
        priority: entry.queue.priority,
    };
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => {
            println!("ID:       {}", output.id);
            println!("Enabled:  {}", output.enabled);
            println!("Repeat:   {}", output.repeat);
            println!("Priority: {}", output.priority);
        }
    }
    Ok(())
}

fn handle_stats(
    services: &Services,
    run_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let run_id = parse_id(&run_id)?;
    let stats = services.stats.update_run_stats(&run_id)?;
    match output_format {
        OutputFormat::Json => {
            let output = StatsOutput {
                run_id: run_id.to_string(),
                stats,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Run ID:   {}", run_id);
            println!("Count:    {}", stats.count);
            println!("Average:  {}", fmt_opt(stats.average));
            println!("Min:      {}", fmt_opt(stats.min));
            println!("Max:      {}", fmt_opt(stats.max));
            println!("Stddev:   {}", fmt_opt(stats.stddev));
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Config { local, command } => {
            let services = open_local(&local)?;
            handle_config(&services, command, &local.output)?;
        }
        Commands::Queue { local, command } => {
            let services = open_local(&local)?;
            handle_queue(&services, command, &local.output)?;
        }
        Commands::Stats { local, run_id } => {
            let services = open_local(&local)?;
            handle_stats(&services, run_id, &local.output)?;
        }
    }

    Ok(())
}
