//! SQLite-backed entry store.
//!
//! `find_one_and_update` runs its select and update inside an IMMEDIATE
//! transaction, which takes the database write lock up front. Claims from
//! other threads (the connection mutex) and other processes (the SQLite lock)
//! are therefore serialized. `update_many` is a single UPDATE statement.

use std::sync::{Arc, Mutex};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use crate::db::{dt_to_ms, ms_to_dt, parse_uuid};
use crate::error::{lock_poisoned, Result};
use crate::queue::entry::{EntryId, QueueEntry, QueueFlags, QueueState};
use crate::queue::store::{Condition, EntryOrder, EntryStore, EntryUpdate, Selector};

const ENTRY_COLUMNS: &str = "id, name, kind, command, archived, created_ms, updated_ms, \
     enabled, auto_repeat, priority, running, started_ms, completed_ms, state_label";

#[derive(Clone)]
pub struct SqliteEntryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEntryStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

impl EntryStore for SqliteEntryStore {
    fn insert(&self, entry: QueueEntry) -> Result<()> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        conn.execute(
            "INSERT INTO queue_entries
             (id, name, kind, command, archived, created_ms, updated_ms,
              enabled, auto_repeat, priority, running, started_ms, completed_ms, state_label)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                entry.id.to_string(),
                entry.name,
                entry.kind,
                entry.command,
                entry.archived,
                dt_to_ms(entry.created),
                dt_to_ms(entry.updated),
                entry.queue.flags.enabled(),
                entry.queue.flags.repeat(),
                entry.queue.priority,
                entry.queue.running,
                entry.queue.started.map(dt_to_ms),
                entry.queue.completed.map(dt_to_ms),
                entry.queue.state,
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let entry = conn
            .query_row(
                &format!("SELECT {} FROM queue_entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id.to_string()],
                map_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn list(&self) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM queue_entries ORDER BY created_ms ASC, id ASC",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map([], map_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn find_one_and_update(
        &self,
        selector: &Selector,
        update: &EntryUpdate,
        order: EntryOrder,
    ) -> Result<Option<QueueEntry>> {
        let mut conn = self.conn.lock().map_err(lock_poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut where_params = Vec::new();
        let where_sql = where_clause(selector, &mut where_params);
        let select_sql = format!(
            "SELECT {} FROM queue_entries WHERE {} {} LIMIT 1",
            ENTRY_COLUMNS,
            where_sql,
            order_clause(order)
        );
        let previous = tx
            .query_row(&select_sql, params_from_iter(where_params.iter()), map_entry)
            .optional()?;

        let Some(previous) = previous else {
            tx.commit()?;
            return Ok(None);
        };

        let mut set_params = Vec::new();
        let set_sql = set_clause(update, &mut set_params);
        set_params.push(Value::Text(previous.id.to_string()));
        tx.execute(
            &format!("UPDATE queue_entries SET {} WHERE id = ?", set_sql),
            params_from_iter(set_params.iter()),
        )?;
        tx.commit()?;
        Ok(Some(previous))
    }

    fn update_many(&self, selector: &Selector, update: &EntryUpdate) -> Result<u64> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let mut sql_params = Vec::new();
        let set_sql = set_clause(update, &mut sql_params);
        let where_sql = where_clause(selector, &mut sql_params);
        let changed = conn.execute(
            &format!("UPDATE queue_entries SET {} WHERE {}", set_sql, where_sql),
            params_from_iter(sql_params.iter()),
        )?;
        Ok(changed as u64)
    }

    fn delete_many(&self, selector: &Selector) -> Result<u64> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let mut sql_params = Vec::new();
        let where_sql = where_clause(selector, &mut sql_params);
        let deleted = conn.execute(
            &format!("DELETE FROM queue_entries WHERE {}", where_sql),
            params_from_iter(sql_params.iter()),
        )?;
        Ok(deleted as u64)
    }
}

fn where_clause(selector: &Selector, params: &mut Vec<Value>) -> String {
    let mut clauses: Vec<String> = Vec::new();

    if let Some(id) = selector.id {
        clauses.push("id = ?".to_string());
        params.push(Value::Text(id.to_string()));
    }
    if let Some(ref ids) = selector.filter.ids {
        if ids.is_empty() {
            clauses.push("0".to_string());
        } else {
            let placeholders = vec!["?"; ids.len()].join(", ");
            clauses.push(format!("id IN ({})", placeholders));
            params.extend(ids.iter().map(|id| Value::Text(id.to_string())));
        }
    }
    if let Some(ref kind) = selector.filter.kind {
        clauses.push("kind = ?".to_string());
        params.push(Value::Text(kind.clone()));
    }
    for condition in &selector.conditions {
        let clause = match condition {
            Condition::Running => "running = 1",
            Condition::NotRunning => "running = 0",
            Condition::Enabled => "enabled = 1",
            Condition::NotArchived => "archived = 0",
            Condition::NotRepeat => "auto_repeat = 0",
        };
        clauses.push(clause.to_string());
    }

    if clauses.is_empty() {
        "1".to_string()
    } else {
        clauses.join(" AND ")
    }
}

fn set_clause(update: &EntryUpdate, params: &mut Vec<Value>) -> String {
    let mut sets: Vec<&str> = Vec::new();

    if let Some(assignment) = update.flag_assignment() {
        if let Some(enabled) = assignment.enabled() {
            sets.push("enabled = ?");
            params.push(Value::Integer(enabled as i64));
        }
        if let Some(repeat) = assignment.repeat() {
            sets.push("auto_repeat = ?");
            params.push(Value::Integer(repeat as i64));
        }
    }
    if let Some(priority) = update.priority_value() {
        sets.push("priority = ?");
        params.push(Value::Integer(priority));
    }
    if let Some(running) = update.running_value() {
        sets.push("running = ?");
        params.push(Value::Integer(running as i64));
    }
    if let Some(started) = update.started_value() {
        sets.push("started_ms = ?");
        params.push(Value::Integer(dt_to_ms(started)));
    }
    if let Some(completed) = update.completed_value() {
        sets.push("completed_ms = ?");
        params.push(Value::Integer(dt_to_ms(completed)));
    }
    if let Some(label) = update.state_label_value() {
        sets.push("state_label = ?");
        params.push(Value::Text(label.to_string()));
    }
    if let Some(archived) = update.archived_value() {
        sets.push("archived = ?");
        params.push(Value::Integer(archived as i64));
    }
    if let Some(updated) = update.updated_value() {
        sets.push("updated_ms = ?");
        params.push(Value::Integer(dt_to_ms(updated)));
    }
    let config = update.config_value();
    if let Some(ref name) = config.name {
        sets.push("name = ?");
        params.push(Value::Text(name.clone()));
    }
    if let Some(ref kind) = config.kind {
        sets.push("kind = ?");
        params.push(Value::Text(kind.clone()));
    }
    if let Some(ref command) = config.command {
        sets.push("command = ?");
        params.push(Value::Text(command.clone()));
    }

    if sets.is_empty() {
        // no-op assignment keeps the statement valid
        "id = id".to_string()
    } else {
        sets.join(", ")
    }
}

fn order_clause(order: EntryOrder) -> &'static str {
    match order {
        EntryOrder::Unordered => "",
        EntryOrder::PriorityThenOldestCompleted => {
            "ORDER BY priority DESC, completed_ms IS NOT NULL, completed_ms ASC, created_ms ASC, id ASC"
        }
    }
}

fn map_entry(row: &rusqlite::Row) -> rusqlite::Result<QueueEntry> {
    let id: String = row.get(0)?;
    let started_ms: Option<i64> = row.get(11)?;
    let completed_ms: Option<i64> = row.get(12)?;
    Ok(QueueEntry {
        id: parse_uuid(&id)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        command: row.get(3)?,
        archived: row.get(4)?,
        created: ms_to_dt(row.get(5)?),
        updated: ms_to_dt(row.get(6)?),
        queue: QueueState {
            flags: QueueFlags::new(row.get(7)?, row.get(8)?),
            priority: row.get(9)?,
            running: row.get(10)?,
            started: started_ms.map(ms_to_dt),
            completed: completed_ms.map(ms_to_dt),
            state: row.get(13)?,
        },
    })
}
