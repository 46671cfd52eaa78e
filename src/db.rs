//! SQLite backend: both documents as rows of a single table.
//!
//! Transactions start with `BEGIN IMMEDIATE`, which takes SQLite's write lock
//! up front so two writers never both read the old documents.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use crate::error::{Error, Result, StoreContext};
use crate::store::{Backend, Documents};

const TASKS_DOC: &str = "tasks";
const SESSIONS_DOC: &str = "sessions";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    name       TEXT PRIMARY KEY CHECK(name IN ('tasks', 'sessions')),
    content    TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);
";

fn set_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA busy_timeout = 5000;
         PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;",
    )
}

fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

fn load(conn: &Connection, name: &str) -> rusqlite::Result<String> {
    let content: Option<String> = conn
        .query_row(
            "SELECT content FROM documents WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(content.unwrap_or_default())
}

fn save(conn: &Connection, name: &str, content: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO documents (name, content) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET
             content = excluded.content,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
        rusqlite::params![name, content],
    )?;
    Ok(())
}

fn load_both(conn: &Connection) -> rusqlite::Result<Documents> {
    Ok(Documents {
        tasks: load(conn, TASKS_DOC)?,
        sessions: load(conn, SESSIONS_DOC)?,
    })
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .store_context(|| format!("failed to open {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .store_context(|| "failed to open in-memory database".into())?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        set_pragmas(&conn).store_context(|| "failed to set pragmas".into())?;
        init(&conn).store_context(|| "failed to create schema".into())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::StoreUnavailable {
            context: "sqlite connection".into(),
            source: "mutex poisoned by a panicking writer".into(),
        })
    }
}

impl Backend for SqliteStore {
    fn read(&self) -> Result<Documents> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .store_context(|| "failed to begin read transaction".into())?;
        let docs = load_both(&tx).store_context(|| "failed to read documents".into())?;
        tx.commit()
            .store_context(|| "failed to end read transaction".into())?;
        Ok(docs)
    }

    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Documents) -> Result<T>,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .store_context(|| "failed to begin write transaction".into())?;
        let before = load_both(&tx).store_context(|| "failed to read documents".into())?;
        let mut working = before.clone();
        // Dropping `tx` on the error path rolls back.
        let out = f(&mut working)?;
        if working.tasks != before.tasks {
            save(&tx, TASKS_DOC, &working.tasks)
                .store_context(|| "failed to write task document".into())?;
        }
        if working.sessions != before.sessions {
            save(&tx, SESSIONS_DOC, &working.sessions)
                .store_context(|| "failed to write session document".into())?;
        }
        tx.commit().store_context(|| "failed to commit".into())?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_database_reads_empty_documents() {
        let store = SqliteStore::open_memory().unwrap();
        assert_eq!(store.read().unwrap(), Documents::default());
    }

    #[test]
    fn transact_round_trips() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .transact(|docs| {
                docs.tasks = "- [ ] a ^1\n".into();
                docs.sessions = "# Active Sessions\n".into();
                Ok(())
            })
            .unwrap();
        let docs = store.read().unwrap();
        assert_eq!(docs.tasks, "- [ ] a ^1\n");
        assert_eq!(docs.sessions, "# Active Sessions\n");
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .transact(|docs| {
                docs.tasks = "keep\n".into();
                Ok(())
            })
            .unwrap();
        let err = store
            .transact(|docs| -> Result<()> {
                docs.tasks.clear();
                Err(Error::NoActiveClaim("20241229-143022-x".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::NoActiveClaim(_)));
        assert_eq!(store.read().unwrap().tasks, "keep\n");
    }

    #[test]
    fn persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .transact(|docs| {
                    docs.sessions = "rows\n".into();
                    Ok(())
                })
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.read().unwrap().sessions, "rows\n");
    }
}
