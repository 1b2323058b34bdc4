use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use perflab::db::Database;
use perflab::error::{PerflabError, Result};
use perflab::queue::{
    Condition, ConfigUpdate, EntryFilter, EntryId, EntryOrder, EntryStore, EntryUpdate,
    MemoryEntryStore, NewConfig, QueueEntry, QueueFlags, QueueScheduler, Selector,
};

type Scheduler = QueueScheduler<Arc<dyn EntryStore>>;

/// One scheduler per backing store. The TempDir must outlive the scheduler.
fn schedulers() -> Vec<(&'static str, Scheduler, Option<TempDir>)> {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("queue.db")).unwrap();
    vec![
        (
            "memory",
            QueueScheduler::new(Arc::new(MemoryEntryStore::new()) as Arc<dyn EntryStore>),
            None,
        ),
        (
            "sqlite",
            QueueScheduler::new(Arc::new(db.entry_store()) as Arc<dyn EntryStore>),
            Some(dir),
        ),
    ]
}

fn entry(name: &str, priority: i64, completed_secs_ago: Option<i64>) -> QueueEntry {
    let mut entry = QueueEntry::new(NewConfig::new(name, "bench", "echo 1"));
    entry.queue.priority = priority;
    entry.queue.completed = completed_secs_ago.map(|s| Utc::now() - Duration::seconds(s));
    entry
}

#[test]
fn test_claim_order_priority_then_oldest_completed() {
    for (name, sched, _dir) in schedulers() {
        let a = entry("A", 5, Some(10));
        let b = entry("B", 5, Some(20));
        let c = entry("C", 9, Some(5));
        for e in [&a, &b, &c] {
            sched.store().insert(e.clone()).unwrap();
        }

        let filter = EntryFilter::all();
        let order: Vec<String> = (0..3)
            .map(|_| sched.claim_next(&filter).unwrap().unwrap().name)
            .collect();
        assert_eq!(order, vec!["C", "B", "A"], "store: {}", name);
        assert!(sched.claim_next(&filter).unwrap().is_none(), "store: {}", name);
    }
}

#[test]
fn test_never_completed_claimed_before_completed() {
    for (name, sched, _dir) in schedulers() {
        let done = entry("done", 0, Some(3600));
        let fresh = entry("fresh", 0, None);
        sched.store().insert(done).unwrap();
        sched.store().insert(fresh).unwrap();

        let first = sched.claim_next(&EntryFilter::all()).unwrap().unwrap();
        assert_eq!(first.name, "fresh", "store: {}", name);
    }
}

#[test]
fn test_claim_returns_pre_update_entry() {
    for (name, sched, _dir) in schedulers() {
        let e = sched
            .insert_config(NewConfig::new("x", "bench", "echo 1"))
            .unwrap();

        let claimed = sched.claim_next(&EntryFilter::all()).unwrap().unwrap();
        assert_eq!(claimed.id, e.id);
        assert!(!claimed.queue.running, "store: {}", name);
        assert!(claimed.queue.started.is_none(), "store: {}", name);

        let stored = sched.get_entry(&e.id).unwrap().unwrap();
        assert!(stored.queue.running, "store: {}", name);
        assert!(stored.queue.started.is_some(), "store: {}", name);
    }
}

#[test]
fn test_claim_skips_disabled_archived_and_running() {
    for (name, sched, _dir) in schedulers() {
        let disabled = sched.insert_config(NewConfig::new("d", "bench", "")).unwrap();
        let archived = sched.insert_config(NewConfig::new("a", "bench", "")).unwrap();
        sched.set_enabled(&disabled.id, false).unwrap();
        sched.archive(&[archived.id]).unwrap();
        sched.set_priority(&archived.id, 100).unwrap();

        assert!(sched.claim_next(&EntryFilter::all()).unwrap().is_none(), "store: {}", name);

        let live = sched.insert_config(NewConfig::new("l", "bench", "")).unwrap();
        assert_eq!(sched.claim_next(&EntryFilter::all()).unwrap().unwrap().id, live.id);
        assert!(sched.claim_next(&EntryFilter::all()).unwrap().is_none(), "store: {}", name);
    }
}

#[test]
fn test_claim_respects_filter() {
    for (name, sched, _dir) in schedulers() {
        sched.insert_config(NewConfig::new("b", "bind", "")).unwrap();
        let nsd = sched.insert_config(NewConfig::new("n", "nsd", "")).unwrap();

        let filter = EntryFilter::all().with_kind("nsd");
        assert_eq!(sched.claim_next(&filter).unwrap().unwrap().id, nsd.id);
        assert!(sched.claim_next(&filter).unwrap().is_none(), "store: {}", name);

        let by_id = EntryFilter::all().with_ids(vec![]);
        assert!(sched.claim_next(&by_id).unwrap().is_none(), "store: {}", name);
    }
}

#[test]
fn test_cascade_invariants() {
    for (name, sched, _dir) in schedulers() {
        let e = sched.insert_config(NewConfig::new("x", "bench", "")).unwrap();

        sched.set_enabled(&e.id, false).unwrap();
        assert!(!sched.get_repeat(&e.id).unwrap().repeat, "store: {}", name);
        assert!(!sched.get_enabled(&e.id).unwrap().enabled, "store: {}", name);

        sched.set_repeat(&e.id, true).unwrap();
        assert!(sched.get_enabled(&e.id).unwrap().enabled, "store: {}", name);
        assert!(sched.get_repeat(&e.id).unwrap().repeat, "store: {}", name);

        // Enabling leaves repeat alone.
        sched.set_repeat(&e.id, false).unwrap();
        sched.set_enabled(&e.id, true).unwrap();
        assert!(!sched.get_repeat(&e.id).unwrap().repeat, "store: {}", name);
    }
}

#[test]
fn test_missing_entry_reads_and_writes() {
    for (name, sched, _dir) in schedulers() {
        let missing = uuid::Uuid::new_v4();
        assert!(!sched.get_enabled(&missing).unwrap().enabled, "store: {}", name);
        assert!(!sched.get_repeat(&missing).unwrap().repeat, "store: {}", name);
        assert!(matches!(
            sched.set_enabled(&missing, true),
            Err(PerflabError::EntryNotFound(_))
        ));
        assert!(matches!(
            sched.set_priority(&missing, 3),
            Err(PerflabError::EntryNotFound(_))
        ));
    }
}

#[test]
fn test_oneshot_protection() {
    for (name, sched, _dir) in schedulers() {
        let repeating = sched.insert_config(NewConfig::new("r", "bench", "")).unwrap();
        let oneshot = sched.insert_config(NewConfig::new("o", "bench", "")).unwrap();
        sched.set_repeat(&oneshot.id, false).unwrap();

        assert!(sched.disable_oneshot(&repeating.id).unwrap().is_none(), "store: {}", name);
        assert!(sched.get_enabled(&repeating.id).unwrap().enabled, "store: {}", name);

        assert!(sched.disable_oneshot(&oneshot.id).unwrap().is_some(), "store: {}", name);
        assert!(!sched.get_enabled(&oneshot.id).unwrap().enabled, "store: {}", name);
    }
}

#[test]
fn test_mark_done_resets_priority_and_sets_completed() {
    for (name, sched, _dir) in schedulers() {
        let e = sched.insert_config(NewConfig::new("x", "bench", "")).unwrap();
        sched.set_priority(&e.id, 7).unwrap();
        sched.claim_next(&EntryFilter::all()).unwrap().unwrap();

        sched.mark_done(&e.id).unwrap();
        let stored = sched.get_entry(&e.id).unwrap().unwrap();
        assert!(!stored.queue.running, "store: {}", name);
        assert_eq!(stored.queue.priority, 0, "store: {}", name);
        assert!(stored.queue.completed.is_some(), "store: {}", name);
    }
}

#[test]
fn test_release_all_keeps_priority_and_completed() {
    for (name, sched, _dir) in schedulers() {
        let a = sched.insert_config(NewConfig::new("a", "bind", "")).unwrap();
        let b = sched.insert_config(NewConfig::new("b", "nsd", "")).unwrap();
        sched.set_priority(&a.id, 4).unwrap();
        sched.claim_next(&EntryFilter::all()).unwrap().unwrap();
        sched.claim_next(&EntryFilter::all()).unwrap().unwrap();

        let released = sched
            .release_all(&EntryFilter::all().with_kind("bind"))
            .unwrap();
        assert_eq!(released, 1, "store: {}", name);

        let a_now = sched.get_entry(&a.id).unwrap().unwrap();
        assert!(!a_now.queue.running, "store: {}", name);
        assert_eq!(a_now.queue.priority, 4, "store: {}", name);
        assert!(a_now.queue.completed.is_none(), "store: {}", name);
        assert!(sched.get_entry(&b.id).unwrap().unwrap().queue.running);

        assert_eq!(sched.release_all(&EntryFilter::all()).unwrap(), 1, "store: {}", name);
        assert_eq!(sched.release_all(&EntryFilter::all()).unwrap(), 0, "store: {}", name);
    }
}

#[test]
fn test_full_cycle_rotates_entries() {
    for (name, sched, _dir) in schedulers() {
        let first = sched.insert_config(NewConfig::new("1", "bench", "")).unwrap();
        let second = sched.insert_config(NewConfig::new("2", "bench", "")).unwrap();
        let filter = EntryFilter::all();

        let a = sched.claim_next(&filter).unwrap().unwrap();
        sched.disable_oneshot(&a.id).unwrap();
        sched.mark_done(&a.id).unwrap();
        thread::sleep(std::time::Duration::from_millis(5));
        let b = sched.claim_next(&filter).unwrap().unwrap();
        sched.mark_done(&b.id).unwrap();

        assert_ne!(a.id, b.id, "store: {}", name);
        assert!([first.id, second.id].contains(&a.id));
        // Both repeat, so the oldest-completed one comes back first.
        let c = sched.claim_next(&filter).unwrap().unwrap();
        assert_eq!(c.id, a.id, "store: {}", name);
    }
}

#[test]
fn test_concurrent_claims_are_mutually_exclusive_memory() {
    let sched = Arc::new(QueueScheduler::new(MemoryEntryStore::new()));
    sched.insert_config(NewConfig::new("only", "bench", "")).unwrap();

    let n = 16;
    let barrier = Arc::new(Barrier::new(n));
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let sched = sched.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                sched.claim_next(&EntryFilter::all()).unwrap()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn test_concurrent_claims_across_connections_sqlite() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");
    let setup = Database::open(&path).unwrap();
    QueueScheduler::new(setup.entry_store())
        .insert_config(NewConfig::new("only", "bench", ""))
        .unwrap();

    let n = 8;
    let barrier = Arc::new(Barrier::new(n));
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let path = path.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let db = Database::open(&path).unwrap();
                let sched = QueueScheduler::new(db.entry_store());
                barrier.wait();
                sched.claim_next(&EntryFilter::all()).unwrap()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn test_sqlite_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");

    let id = {
        let db = Database::open(&path).unwrap();
        let sched = QueueScheduler::new(db.entry_store());
        let e = sched.insert_config(NewConfig::new("x", "bench", "")).unwrap();
        sched.set_priority(&e.id, 3).unwrap();
        sched.claim_next(&EntryFilter::all()).unwrap().unwrap();
        e.id
    };

    let db = Database::open(&path).unwrap();
    let sched = QueueScheduler::new(db.entry_store());
    let stored = sched.get_entry(&id).unwrap().unwrap();
    assert!(stored.queue.running);
    assert_eq!(stored.queue.priority, 3);

    assert_eq!(sched.release_all(&EntryFilter::all()).unwrap(), 1);
    assert!(sched.claim_next(&EntryFilter::all()).unwrap().is_some());
}

#[test]
fn test_stored_flags_read_back_unchanged() {
    for (name, sched, _dir) in schedulers() {
        let mut e = entry("x", 0, None);
        e.queue.flags = QueueFlags::new(false, true);
        sched.store().insert(e.clone()).unwrap();

        assert!(!sched.get_enabled(&e.id).unwrap().enabled, "store: {}", name);
        assert!(sched.get_repeat(&e.id).unwrap().repeat, "store: {}", name);
        assert!(sched.claim_next(&EntryFilter::all()).unwrap().is_none(), "store: {}", name);
    }
}

#[test]
fn test_row_edited_outside_scheduler_stays_disabled() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");
    let db = Database::open(&path).unwrap();
    let sched = QueueScheduler::new(db.entry_store());
    let e = sched.insert_config(NewConfig::new("x", "bench", "")).unwrap();

    let other = rusqlite::Connection::open(&path).unwrap();
    other
        .execute(
            "UPDATE queue_entries SET enabled = 0, auto_repeat = 1 WHERE id = ?1",
            [e.id.to_string()],
        )
        .unwrap();

    assert!(!sched.get_enabled(&e.id).unwrap().enabled);
    assert!(sched.get_repeat(&e.id).unwrap().repeat);
    assert!(sched.claim_next(&EntryFilter::all()).unwrap().is_none());

    // The next write through the scheduler restores the cascade.
    sched.set_repeat(&e.id, true).unwrap();
    assert!(sched.get_enabled(&e.id).unwrap().enabled);
    assert!(sched.claim_next(&EntryFilter::all()).unwrap().is_some());
}

/// Delegates to a memory store but fails every conditional disable.
struct FailingDisableStore(MemoryEntryStore);

impl EntryStore for FailingDisableStore {
    fn insert(&self, entry: QueueEntry) -> Result<()> {
        self.0.insert(entry)
    }

    fn get(&self, id: &EntryId) -> Result<Option<QueueEntry>> {
        self.0.get(id)
    }

    fn list(&self) -> Result<Vec<QueueEntry>> {
        self.0.list()
    }

    fn find_one_and_update(
        &self,
        selector: &Selector,
        update: &EntryUpdate,
        order: EntryOrder,
    ) -> Result<Option<QueueEntry>> {
        if selector.conditions.contains(&Condition::NotRepeat) {
            return Err(PerflabError::StoreUnavailable("disk I/O error".to_string()));
        }
        self.0.find_one_and_update(selector, update, order)
    }

    fn update_many(&self, selector: &Selector, update: &EntryUpdate) -> Result<u64> {
        self.0.update_many(selector, update)
    }

    fn delete_many(&self, selector: &Selector) -> Result<u64> {
        self.0.delete_many(selector)
    }
}

#[test]
fn test_finish_claim_marks_done_when_disable_fails() {
    let sched = QueueScheduler::new(FailingDisableStore(MemoryEntryStore::new()));
    let e = sched.insert_config(NewConfig::new("x", "bench", "")).unwrap();
    sched.set_repeat(&e.id, false).unwrap();
    sched.claim_next(&EntryFilter::all()).unwrap().unwrap();

    let err = sched.finish_claim(&e.id, "idle").unwrap_err();
    assert!(matches!(err, PerflabError::StoreUnavailable(_)));

    let stored = sched.get_entry(&e.id).unwrap().unwrap();
    assert!(!stored.queue.running);
    assert_eq!(stored.queue.priority, 0);
    assert!(stored.queue.completed.is_some());
}

#[test]
fn test_update_config_touches_only_descriptive_fields() {
    for (name, sched, _dir) in schedulers() {
        let e = sched.insert_config(NewConfig::new("x", "bind", "echo 1")).unwrap();
        sched.set_priority(&e.id, 6).unwrap();
        sched.set_repeat(&e.id, false).unwrap();
        thread::sleep(std::time::Duration::from_millis(5));

        let update = ConfigUpdate {
            name: Some("renamed".to_string()),
            kind: Some("nsd".to_string()),
            command: None,
        };
        let updated = sched.update_config(&e.id, update).unwrap();
        let stored = sched.get_entry(&e.id).unwrap().unwrap();
        assert_eq!(stored, updated, "store: {}", name);
        assert_eq!(stored.name, "renamed", "store: {}", name);
        assert_eq!(stored.kind, "nsd", "store: {}", name);
        assert_eq!(stored.command, "echo 1", "store: {}", name);
        assert_eq!(stored.created, e.created, "store: {}", name);
        assert!(stored.updated > e.updated, "store: {}", name);
        assert_eq!(stored.queue.priority, 6, "store: {}", name);
        assert!(!stored.queue.flags.repeat(), "store: {}", name);

        let missing = uuid::Uuid::new_v4();
        assert!(matches!(
            sched.update_config(&missing, ConfigUpdate::default()),
            Err(PerflabError::EntryNotFound(_))
        ));
    }
}

#[test]
fn test_delete_configs_removes_only_listed() {
    for (name, sched, _dir) in schedulers() {
        let a = sched.insert_config(NewConfig::new("a", "bench", "")).unwrap();
        let b = sched.insert_config(NewConfig::new("b", "bench", "")).unwrap();
        let c = sched.insert_config(NewConfig::new("c", "bench", "")).unwrap();

        let deleted = sched
            .delete_configs(&[a.id, c.id, uuid::Uuid::new_v4()])
            .unwrap();
        assert_eq!(deleted, 2, "store: {}", name);
        let left: Vec<_> = sched.list_entries().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(left, vec![b.id], "store: {}", name);
        assert_eq!(sched.delete_configs(&[]).unwrap(), 0, "store: {}", name);
    }
}
