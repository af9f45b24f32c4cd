//! Durable persistence keyed by record id.
//!
//! The delivery engine only sees the narrow [`LogStore`] seam; whether a
//! batch is backed by SQLite, by memory, or by the degraded memory+spool
//! path is the router's business.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{info, warn};

use crate::entry::LogEntry;
use crate::spool::Spool;
use crate::INTERNAL_TARGET;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("store schema version {found} is ahead of supported version {supported}")]
    SchemaAhead { found: u32, supported: u32 },
    #[error("record has no id: {message}")]
    MissingId { message: String },
}

/// Narrow persistence seam injected into the delivery engine.
///
/// `read_oldest` is non-destructive; records leave the store only through
/// `delete_by_ids` after an acknowledged send.
pub trait LogStore: Send {
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<(), StoreError>;
    fn read_oldest(&mut self, n: usize) -> Result<Vec<LogEntry>, StoreError>;
    fn read_all(&mut self) -> Result<Vec<LogEntry>, StoreError>;
    fn delete_by_ids(&mut self, ids: &[String]) -> Result<(), StoreError>;
    fn clear(&mut self) -> Result<(), StoreError>;
    fn len(&mut self) -> Result<usize, StoreError>;
}

/// SQLite-backed store. One row per record, insertion order preserved by
/// `seq`, the record id as the unique lookup key. The connection opens
/// lazily on first use and is then shared by every caller.
pub struct SqliteStore {
    path: PathBuf,
    schema_version: u32,
    conn: Option<Connection>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>, schema_version: u32) -> Self {
        Self {
            path: path.into(),
            schema_version,
            conn: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&mut self) -> Result<&Connection, StoreError> {
        if self.conn.is_none() {
            self.conn = Some(open_store(&self.path, self.schema_version)?);
        }
        Ok(self.conn.as_ref().expect("connection opened above"))
    }

    fn conn_mut(&mut self) -> Result<&mut Connection, StoreError> {
        if self.conn.is_none() {
            self.conn = Some(open_store(&self.path, self.schema_version)?);
        }
        Ok(self.conn.as_mut().expect("connection opened above"))
    }
}

fn open_store(path: &Path, schema_version: u32) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA temp_store=MEMORY;
        ",
    )?;

    let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let found = found as u32;
    if found > schema_version {
        // A newer writer owns this file. Surface it; the caller routes to
        // the fallback instead of tearing the file down.
        warn!(
            target: INTERNAL_TARGET,
            component = "store",
            event = "store.open.schema_ahead",
            path = %path.display(),
            found,
            supported = schema_version
        );
        return Err(StoreError::SchemaAhead {
            found,
            supported: schema_version,
        });
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS log_entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            payload TEXT NOT NULL
        );
        ",
    )?;
    if found < schema_version {
        conn.execute_batch(&format!("PRAGMA user_version = {schema_version};"))?;
    }

    Ok(conn)
}

impl LogStore for SqliteStore {
    /// All-or-nothing: the batch lands in one transaction.
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let tx = self.conn_mut()?.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO log_entries (id, payload) VALUES (?1, ?2)")?;
            for entry in &entries {
                let id = entry.id.as_deref().ok_or_else(|| StoreError::MissingId {
                    message: entry.message.clone(),
                })?;
                let payload = serde_json::to_string(entry)?;
                stmt.execute(params![id, payload])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn read_oldest(&mut self, n: usize) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT payload FROM log_entries ORDER BY seq ASC LIMIT ?1")?;
        let mut rows = stmt.query(params![n as i64])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            match serde_json::from_str::<LogEntry>(&payload) {
                Ok(entry) => out.push(entry),
                Err(err) => warn!(
                    target: INTERNAL_TARGET,
                    component = "store",
                    event = "store.read.corrupt_row",
                    error = %err
                ),
            }
        }
        Ok(out)
    }

    fn read_all(&mut self) -> Result<Vec<LogEntry>, StoreError> {
        self.read_oldest(usize::MAX >> 1)
    }

    /// One failed id must not abort its siblings, so deletes run row by row
    /// outside a transaction.
    fn delete_by_ids(&mut self, ids: &[String]) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("DELETE FROM log_entries WHERE id = ?1")?;
        for id in ids {
            if let Err(err) = stmt.execute(params![id]) {
                warn!(
                    target: INTERNAL_TARGET,
                    component = "store",
                    event = "store.delete.row_failed",
                    id = %id,
                    error = %err
                );
            }
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.conn()?.execute("DELETE FROM log_entries", [])?;
        Ok(())
    }

    fn len(&mut self) -> Result<usize, StoreError> {
        let count: i64 =
            self.conn()?
                .query_row("SELECT COUNT(*) FROM log_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Plain FIFO queue used when no durable store is available.
#[derive(Default)]
pub struct MemoryStore {
    entries: VecDeque<LogEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records recovered from the spool deliver before anything captured in
    /// this run.
    pub fn prepend(&mut self, entries: Vec<LogEntry>) {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }
}

impl LogStore for MemoryStore {
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        self.entries.extend(entries);
        Ok(())
    }

    fn read_oldest(&mut self, n: usize) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self.entries.iter().take(n).cloned().collect())
    }

    fn read_all(&mut self) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self.entries.iter().cloned().collect())
    }

    fn delete_by_ids(&mut self, ids: &[String]) -> Result<(), StoreError> {
        self.entries
            .retain(|entry| !matches!(&entry.id, Some(id) if ids.contains(id)));
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }

    fn len(&mut self) -> Result<usize, StoreError> {
        Ok(self.entries.len())
    }
}

/// Routes between the durable store and the memory+spool fallback.
///
/// A durable failure flips the router to the fallback for the rest of the
/// run (logged once); rows already persisted stay in SQLite and are drained
/// on the next run. The spool mirrors the memory queue after every
/// fallback-path mutation.
pub struct StoreRouter {
    durable: Option<SqliteStore>,
    memory: MemoryStore,
    spool: Option<Spool>,
    degraded: bool,
}

impl StoreRouter {
    pub fn new(durable: Option<SqliteStore>, spool: Option<Spool>) -> Self {
        Self {
            durable,
            memory: MemoryStore::new(),
            spool,
            degraded: false,
        }
    }

    /// Merges any spooled backlog into the active store; called once at
    /// construction, before new records arrive.
    pub fn load_backlog(&mut self) {
        let Some(spool) = &self.spool else { return };
        let mut backlog = spool.load();
        if backlog.is_empty() {
            return;
        }
        for entry in backlog.iter_mut() {
            entry.ensure_id();
        }

        if self.durable_healthy() {
            let count = backlog.len();
            if let Some(durable) = self.durable.as_mut() {
                match durable.append(backlog.clone()) {
                    Ok(()) => {
                        info!(
                            target: INTERNAL_TARGET,
                            component = "store",
                            event = "store.backlog.merged",
                            records = count
                        );
                        return;
                    }
                    Err(err) => self.degrade("append", &err),
                }
            }
        }
        self.memory.prepend(backlog);
        self.mirror_spool();
    }

    pub fn is_durable(&self) -> bool {
        self.durable.is_some() && !self.degraded
    }

    fn durable_healthy(&self) -> bool {
        self.is_durable()
    }

    fn degrade(&mut self, op: &str, err: &StoreError) {
        if !self.degraded {
            warn!(
                target: INTERNAL_TARGET,
                component = "store",
                event = "store.degraded",
                op,
                error = %err
            );
        }
        self.degraded = true;
    }

    fn mirror_spool(&mut self) {
        if let Some(spool) = &self.spool {
            match self.memory.read_all() {
                Ok(entries) => spool.save(&entries),
                Err(_) => {}
            }
        }
    }
}

impl LogStore for StoreRouter {
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        if self.durable_healthy() {
            let durable = self.durable.as_mut().expect("durable checked above");
            match durable.append(entries.clone()) {
                Ok(()) => return Ok(()),
                Err(err) => self.degrade("append", &err),
            }
        }
        self.memory.append(entries)?;
        self.mirror_spool();
        Ok(())
    }

    fn read_oldest(&mut self, n: usize) -> Result<Vec<LogEntry>, StoreError> {
        if self.durable_healthy() {
            let durable = self.durable.as_mut().expect("durable checked above");
            match durable.read_oldest(n) {
                Ok(entries) => return Ok(entries),
                Err(err) => self.degrade("read", &err),
            }
        }
        self.memory.read_oldest(n)
    }

    fn read_all(&mut self) -> Result<Vec<LogEntry>, StoreError> {
        if self.durable_healthy() {
            let durable = self.durable.as_mut().expect("durable checked above");
            match durable.read_all() {
                Ok(entries) => return Ok(entries),
                Err(err) => self.degrade("read", &err),
            }
        }
        self.memory.read_all()
    }

    fn delete_by_ids(&mut self, ids: &[String]) -> Result<(), StoreError> {
        if self.durable_healthy() {
            let durable = self.durable.as_mut().expect("durable checked above");
            match durable.delete_by_ids(ids) {
                Ok(()) => return Ok(()),
                Err(err) => self.degrade("delete", &err),
            }
        }
        self.memory.delete_by_ids(ids)?;
        self.mirror_spool();
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        if self.durable_healthy() {
            let durable = self.durable.as_mut().expect("durable checked above");
            match durable.clear() {
                Ok(()) => return Ok(()),
                Err(err) => self.degrade("clear", &err),
            }
        }
        self.memory.clear()?;
        self.mirror_spool();
        Ok(())
    }

    fn len(&mut self) -> Result<usize, StoreError> {
        if self.durable_healthy() {
            let durable = self.durable.as_mut().expect("durable checked above");
            match durable.len() {
                Ok(len) => return Ok(len),
                Err(err) => self.degrade("len", &err),
            }
        }
        self.memory.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Level;
    use tempfile::tempdir;

    fn entry(message: &str) -> LogEntry {
        let mut entry = LogEntry::new(Level::Info, message, "svc");
        entry.ensure_id();
        entry
    }

    #[test]
    fn sqlite_round_trips_in_insertion_order() {
        let dir = tempdir().unwrap();
        let mut store = SqliteStore::new(dir.path().join("logs.sqlite"), 1);

        store
            .append(vec![entry("a"), entry("b"), entry("c")])
            .unwrap();
        assert_eq!(store.len().unwrap(), 3);

        let oldest = store.read_oldest(2).unwrap();
        let messages: Vec<_> = oldest.iter().map(|e| e.message.clone()).collect();
        assert_eq!(messages, vec!["a", "b"]);

        // Non-destructive read.
        assert_eq!(store.len().unwrap(), 3);
    }

    #[test]
    fn sqlite_batch_append_is_all_or_nothing() {
        let dir = tempdir().unwrap();
        let mut store = SqliteStore::new(dir.path().join("logs.sqlite"), 1);

        let first = entry("first");
        store.append(vec![first.clone()]).unwrap();

        // A duplicate id inside the batch rolls the whole batch back.
        let err = store
            .append(vec![entry("fresh"), first])
            .expect_err("duplicate id should fail the transaction");
        assert!(matches!(err, StoreError::Sqlite(_)));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn sqlite_delete_removes_only_named_ids() {
        let dir = tempdir().unwrap();
        let mut store = SqliteStore::new(dir.path().join("logs.sqlite"), 1);

        let batch = vec![entry("a"), entry("b"), entry("c")];
        let drop_id = batch[1].id.clone().unwrap();
        store.append(batch).unwrap();

        store
            .delete_by_ids(&[drop_id, "missing-id".to_string()])
            .unwrap();

        let left: Vec<_> = store
            .read_all()
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(left, vec!["a", "c"]);
    }

    #[test]
    fn sqlite_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs.sqlite");
        {
            let mut store = SqliteStore::new(&path, 1);
            store.append(vec![entry("persisted")]).unwrap();
        }

        let mut reopened = SqliteStore::new(&path, 1);
        let all = reopened.read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].message, "persisted");
    }

    #[test]
    fn sqlite_refuses_a_schema_from_the_future() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs.sqlite");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA user_version = 9;").unwrap();
        }

        let mut store = SqliteStore::new(&path, 1);
        let err = store.len().expect_err("newer schema must be surfaced");
        assert!(matches!(
            err,
            StoreError::SchemaAhead {
                found: 9,
                supported: 1
            }
        ));
    }

    #[test]
    fn sqlite_rejects_entries_without_ids() {
        let dir = tempdir().unwrap();
        let mut store = SqliteStore::new(dir.path().join("logs.sqlite"), 1);
        let missing = LogEntry::new(Level::Info, "no id", "svc");
        assert!(matches!(
            store.append(vec![missing]),
            Err(StoreError::MissingId { .. })
        ));
    }

    #[test]
    fn memory_store_is_fifo_with_id_deletes() {
        let mut store = MemoryStore::new();
        let batch = vec![entry("a"), entry("b")];
        let first_id = batch[0].id.clone().unwrap();
        store.append(batch).unwrap();

        assert_eq!(store.read_oldest(1).unwrap()[0].message, "a");
        store.delete_by_ids(&[first_id]).unwrap();
        assert_eq!(store.read_all().unwrap()[0].message, "b");
    }

    #[test]
    fn memory_prepend_puts_backlog_first() {
        let mut store = MemoryStore::new();
        store.append(vec![entry("new")]).unwrap();
        store.prepend(vec![entry("old-1"), entry("old-2")]);

        let order: Vec<_> = store
            .read_all()
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(order, vec!["old-1", "old-2", "new"]);
    }

    #[test]
    fn router_prefers_durable_and_ignores_memory() {
        let dir = tempdir().unwrap();
        let mut router = StoreRouter::new(
            Some(SqliteStore::new(dir.path().join("logs.sqlite"), 1)),
            None,
        );
        router.append(vec![entry("durable")]).unwrap();
        assert!(router.is_durable());
        assert_eq!(router.len().unwrap(), 1);
    }

    #[test]
    fn router_degrades_to_spool_on_open_failure() {
        let dir = tempdir().unwrap();
        // A directory at the database path makes every open fail.
        let bad_path = dir.path().join("not-a-file");
        fs::create_dir_all(&bad_path).unwrap();

        let spool_path = dir.path().join("spool.json");
        let mut router = StoreRouter::new(
            Some(SqliteStore::new(&bad_path, 1)),
            Some(Spool::new(&spool_path, 64 * 1024)),
        );

        router.append(vec![entry("fallback")]).unwrap();
        assert!(!router.is_durable());
        assert_eq!(router.len().unwrap(), 1);
        assert!(spool_path.exists());

        // Acknowledged deletes rewrite the slot.
        let id = router.read_oldest(1).unwrap()[0].id.clone().unwrap();
        router.delete_by_ids(&[id]).unwrap();
        assert!(!spool_path.exists());
    }

    #[test]
    fn router_recovers_spooled_backlog_into_durable() {
        let dir = tempdir().unwrap();
        let spool = Spool::new(dir.path().join("spool.json"), 64 * 1024);
        spool.save(&[entry("from-last-run")]);

        let mut router = StoreRouter::new(
            Some(SqliteStore::new(dir.path().join("logs.sqlite"), 1)),
            Some(Spool::new(dir.path().join("spool.json"), 64 * 1024)),
        );
        router.load_backlog();

        assert_eq!(router.len().unwrap(), 1);
        assert!(!dir.path().join("spool.json").exists());
        assert_eq!(router.read_all().unwrap()[0].message, "from-last-run");
    }
}
