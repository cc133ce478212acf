use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use cwp_core::{now_unix, Archive, ArchiveReceipt, EngineError, ItemId, WorkItem};
use cwp_queue::QueueBackend;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

/// Queue backend on an embedded SQLite database. Several queues can share one file.
///
/// Same contract as the directory queue: ids come from a per-queue counter row updated inside
/// an immediate transaction, and archival is a single `UPDATE ... WHERE state = 'pending'`.
pub struct SqliteQueue {
    name: String,
    conn: Mutex<Connection>,
}

impl SqliteQueue {
    pub fn open(db_path: &Path, name: impl Into<String>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db {}", db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql)?;
        Ok(Self { name: name.into(), conn: Mutex::new(conn) })
    }

    pub fn open_in_memory(name: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("../migrations/0001_init.sql"))?;
        Ok(Self { name: name.into(), conn: Mutex::new(conn) })
    }

    fn state_to_str(a: Archive) -> &'static str {
        a.as_str()
    }

    fn row_to_item(&self, id: i64, discriminator: String, created_at: i64) -> WorkItem {
        WorkItem {
            id: ItemId(id as u64),
            queue_name: self.name.clone(),
            discriminator,
            key: id.to_string(),
            created_at_unix: created_at,
        }
    }

    fn list_state(&self, state: &str) -> Result<Vec<WorkItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, discriminator, created_at FROM items WHERE queue = ?1 AND state = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![self.name, state], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
        })?;
        let mut items = vec![];
        for row in rows {
            let (id, disc, created) = row?;
            items.push(self.row_to_item(id, disc, created));
        }
        Ok(items)
    }

    fn item_key(item: &WorkItem) -> Result<i64> {
        item.key.parse::<i64>().map_err(|_| anyhow!("sqlite queue key {:?} is not a row id", item.key))
    }
}

impl QueueBackend for SqliteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&self, discriminator: &str, payload: &[u8]) -> Result<ItemId> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO counters(queue, max_id) VALUES (?1, 1)
             ON CONFLICT(queue) DO UPDATE SET max_id = max_id + 1",
            params![self.name],
        )?;
        let id: i64 = tx.query_row("SELECT max_id FROM counters WHERE queue = ?1", params![self.name], |r| r.get(0))?;
        let inserted = tx.execute(
            "INSERT INTO items(queue, id, discriminator, payload, state, created_at) VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![self.name, id, discriminator, payload, now_unix()],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(EngineError::DuplicateItem(format!("{}/{}", self.name, id)).into());
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;
        info!(queue = %self.name, id, "enqueued");
        Ok(ItemId(id as u64))
    }

    fn list_pending(&self) -> Result<Vec<WorkItem>> {
        self.list_state("pending")
    }

    fn read(&self, item: &WorkItem) -> Result<Vec<u8>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT payload FROM items WHERE queue = ?1 AND id = ?2",
            params![self.name, Self::item_key(item)?],
            |r| r.get::<_, Vec<u8>>(0),
        )
        .optional()?
        .ok_or_else(|| EngineError::ItemNotFound(item.key.clone()).into())
    }

    fn archive(&self, item: &WorkItem, archive: Archive) -> Result<ArchiveReceipt> {
        let id = Self::item_key(item)?;
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE items SET state = ?1, archived_at = ?2 WHERE queue = ?3 AND id = ?4 AND state = 'pending'",
            params![Self::state_to_str(archive), now_unix(), self.name, id],
        )?;
        let location = format!("{}/{}", self.name, id);
        if changed == 1 {
            info!(queue = %self.name, id, archive = archive.as_str(), "archived");
            return Ok(ArchiveReceipt { archive, location, already_archived: false });
        }

        let state: Option<String> = conn
            .query_row("SELECT state FROM items WHERE queue = ?1 AND id = ?2", params![self.name, id], |r| r.get(0))
            .optional()?;
        match state.as_deref().and_then(Archive::parse) {
            Some(found) => {
                debug!(queue = %self.name, id, "already archived, nothing to do");
                Ok(ArchiveReceipt { archive: found, location, already_archived: true })
            }
            None => Err(EngineError::ItemNotFound(item.key.clone()).into()),
        }
    }

    fn list_archived(&self, archive: Archive) -> Result<Vec<WorkItem>> {
        self.list_state(Self::state_to_str(archive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn same_contract_as_directory_queue() {
        let dir = tempdir().unwrap();
        let q = SqliteQueue::open(&dir.path().join("queue.db"), "mail").unwrap();
        let ids: Vec<u64> = ["a", "b", "c"].iter().map(|d| q.push(d, d.as_bytes()).unwrap().get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let pending = q.list_pending().unwrap();
        let two = pending.iter().find(|i| i.id == ItemId(2)).unwrap().clone();
        assert_eq!(q.read(&two).unwrap(), b"b");

        q.archive(&two, Archive::Processed).unwrap();
        let again = q.archive(&two, Archive::Rejected).unwrap();
        assert!(again.already_archived);
        assert_eq!(again.archive, Archive::Processed);

        let left: Vec<u64> = q.list_pending().unwrap().iter().map(|i| i.id.get()).collect();
        assert_eq!(left, vec![1, 3]);
        assert_eq!(q.list_archived(Archive::Processed).unwrap().len(), 1);
    }

    #[test]
    fn queues_sharing_a_database_count_independently() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("queue.db");
        let mail = SqliteQueue::open(&db, "mail").unwrap();
        let jobs = SqliteQueue::open(&db, "jobs").unwrap();
        assert_eq!(mail.push("x", b"1").unwrap(), ItemId(1));
        assert_eq!(jobs.push("y", b"1").unwrap(), ItemId(1));
        assert_eq!(mail.push("x", b"2").unwrap(), ItemId(2));
        assert_eq!(jobs.list_pending().unwrap().len(), 1);
    }

    #[test]
    fn unknown_item_is_not_found() {
        let q = SqliteQueue::open_in_memory("mail").unwrap();
        let ghost = WorkItem {
            id: ItemId(5),
            queue_name: "mail".into(),
            discriminator: "x".into(),
            key: "5".into(),
            created_at_unix: 0,
        };
        assert!(q.archive(&ghost, Archive::Processed).is_err());
        assert!(q.read(&ghost).is_err());
    }
}
