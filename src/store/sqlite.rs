use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::db::{dt_to_ms, ms_to_dt, parse_uuid};
use crate::error::{lock_poisoned, Result};
use crate::queue::EntryId;
use crate::stats::RunStats;
use crate::store::{
    ControlStore, PausedStatus, Run, RunId, RunQuery, RunStore, Sample, SampleStore,
};

const RUN_COLUMNS: &str = "id, config_id, samples_per_run, created_ms, updated_ms, stats_json";

#[derive(Clone)]
pub struct SqliteRunStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

impl SampleStore for SqliteRunStore {
    fn insert_sample(&self, sample: Sample) -> Result<()> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        conn.execute(
            "INSERT INTO samples (id, run_id, config_id, value, created_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sample.id.to_string(),
                sample.run_id.to_string(),
                sample.config_id.to_string(),
                sample.value,
                dt_to_ms(sample.created),
            ],
        )?;
        Ok(())
    }

    fn samples_for_run(&self, run_id: &RunId) -> Result<Vec<Sample>> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, config_id, value, created_ms
             FROM samples WHERE run_id = ?1
             ORDER BY created_ms ASC, seq ASC",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            let id: String = row.get(0)?;
            let run_id: String = row.get(1)?;
            let config_id: String = row.get(2)?;
            Ok(Sample {
                id: parse_uuid(&id)?,
                run_id: parse_uuid(&run_id)?,
                config_id: parse_uuid(&config_id)?,
                value: row.get(3)?,
                created: ms_to_dt(row.get(4)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl RunStore for SqliteRunStore {
    fn insert_run(&self, run: Run) -> Result<()> {
        let stats_json = run.stats.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        conn.execute(
            "INSERT INTO runs (id, config_id, samples_per_run, created_ms, updated_ms, stats_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.id.to_string(),
                run.config_id.to_string(),
                run.samples_per_run,
                dt_to_ms(run.created),
                dt_to_ms(run.updated),
                stats_json,
            ],
        )?;
        Ok(())
    }

    fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![id.to_string()],
                map_run_row,
            )
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }

    fn runs_for_config(&self, config_id: &EntryId, query: &RunQuery) -> Result<Vec<Run>> {
        // LIMIT -1 is unbounded in SQLite
        let limit = if query.limit == 0 { -1 } else { query.limit as i64 };
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE config_id = ?1 AND created_ms >= ?2
             ORDER BY created_ms DESC, id DESC LIMIT ?3 OFFSET ?4",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                config_id.to_string(),
                query.from.map_or(i64::MIN, dt_to_ms),
                limit,
                query.skip as i64,
            ],
            map_run_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_run()?);
        }
        Ok(out)
    }

    fn write_stats(&self, id: &RunId, stats: &RunStats) -> Result<bool> {
        let stats_json = serde_json::to_string(stats)?;
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let changed = conn.execute(
            "UPDATE runs SET stats_json = ?2, updated_ms = ?3 WHERE id = ?1",
            params![id.to_string(), stats_json, dt_to_ms(Utc::now())],
        )?;
        Ok(changed > 0)
    }

    fn delete_runs_for_configs(&self, config_ids: &[EntryId]) -> Result<u64> {
        if config_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; config_ids.len()].join(", ");
        let ids: Vec<Value> = config_ids
            .iter()
            .map(|id| Value::Text(id.to_string()))
            .collect();

        let mut conn = self.conn.lock().map_err(lock_poisoned)?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!("DELETE FROM samples WHERE config_id IN ({})", placeholders),
            params_from_iter(ids.iter()),
        )?;
        let deleted = tx.execute(
            &format!("DELETE FROM runs WHERE config_id IN ({})", placeholders),
            params_from_iter(ids.iter()),
        )?;
        tx.commit()?;
        Ok(deleted as u64)
    }
}

/// A `runs` row before its stats JSON is decoded.
struct RunRow {
    run: Run,
    stats_json: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let mut run = self.run;
        run.stats = self
            .stats_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(run)
    }
}

fn map_run_row(row: &rusqlite::Row) -> rusqlite::Result<RunRow> {
    let id: String = row.get(0)?;
    let config_id: String = row.get(1)?;
    Ok(RunRow {
        run: Run {
            id: parse_uuid(&id)?,
            config_id: parse_uuid(&config_id)?,
            samples_per_run: row.get(2)?,
            created: ms_to_dt(row.get(3)?),
            updated: ms_to_dt(row.get(4)?),
            stats: None,
        },
        stats_json: row.get(5)?,
    })
}

#[derive(Clone)]
pub struct SqliteControlStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteControlStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

impl ControlStore for SqliteControlStore {
    fn set_paused(&self, paused: bool) -> Result<()> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        conn.execute(
            "INSERT INTO control (singleton, paused) VALUES (1, ?1)
             ON CONFLICT(singleton) DO UPDATE SET paused = excluded.paused",
            params![paused],
        )?;
        Ok(())
    }

    fn get_paused(&self) -> Result<PausedStatus> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let paused: Option<bool> = conn
            .query_row("SELECT paused FROM control WHERE singleton = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(PausedStatus {
            paused: paused.unwrap_or(false),
        })
    }
}
