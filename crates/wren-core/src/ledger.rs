//! Durable interaction ledger.
//!
//! A single append-only table of `(subject, kind)` unique pairs is the entire
//! durable contract. Its primary-key constraint is also the only cross-process
//! synchronization primitive the bot relies on: whichever writer inserts a
//! pair first owns the action, everyone else skips.

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::{
    domain::{ActionKind, SubjectId},
    Error, Result,
};

pub struct InteractionLedger {
    conn: Mutex<Connection>,
}

impl InteractionLedger {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))?;
        Self::init(&conn)?;
        tracing::info!("ledger opened: {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory ledger, used by tests and fakes. Same schema, no durability.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS interactions (
              subject TEXT NOT NULL,
              kind TEXT NOT NULL,
              recorded_at TEXT NOT NULL,
              PRIMARY KEY (subject, kind)
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("ledger mutex poisoned".to_string()))
    }

    /// Whether `(subject, kind)` has already been recorded. A storage failure
    /// is an error, never a silent `false`.
    pub fn exists(&self, subject: &SubjectId, kind: ActionKind) -> Result<bool> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT 1 FROM interactions WHERE subject = ?1 AND kind = ?2")?;
        let found = stmt.exists(params![subject.0, kind.as_str()])?;
        Ok(found)
    }

    /// Record `(subject, kind)` as handled. Set-union semantics: inserting an
    /// existing pair is success, not an error. Returns whether a new row was
    /// written, so a caller that loses a concurrent race can tell.
    pub fn insert(&self, subject: &SubjectId, kind: ActionKind) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO interactions (subject, kind, recorded_at) VALUES (?1, ?2, ?3)",
            params![subject.0, kind.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM interactions", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Cheap liveness probe for the health surface.
    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(s: &str) -> SubjectId {
        SubjectId(s.to_string())
    }

    #[test]
    fn insert_twice_stores_one_entry_and_no_error() {
        let ledger = InteractionLedger::open_in_memory().unwrap();
        assert!(ledger.insert(&subject("at://a/post/1"), ActionKind::Like).unwrap());
        assert!(!ledger.insert(&subject("at://a/post/1"), ActionKind::Like).unwrap());
        assert_eq!(ledger.count().unwrap(), 1);
        assert!(ledger.exists(&subject("at://a/post/1"), ActionKind::Like).unwrap());
    }

    #[test]
    fn same_subject_different_kind_is_a_distinct_entry() {
        let ledger = InteractionLedger::open_in_memory().unwrap();
        ledger.insert(&subject("did:plc:x"), ActionKind::Follow).unwrap();
        ledger.insert(&subject("did:plc:x"), ActionKind::Like).unwrap();
        assert_eq!(ledger.count().unwrap(), 2);
        assert!(!ledger.exists(&subject("did:plc:x"), ActionKind::Post).unwrap());
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wren.db");

        {
            let ledger = InteractionLedger::open(&path).unwrap();
            ledger.insert(&subject("at://a/post/9"), ActionKind::Like).unwrap();
        }

        let reopened = InteractionLedger::open(&path).unwrap();
        assert!(reopened.exists(&subject("at://a/post/9"), ActionKind::Like).unwrap());
        assert_eq!(reopened.count().unwrap(), 1);
    }

    #[test]
    fn health_check_passes_on_open_store() {
        let ledger = InteractionLedger::open_in_memory().unwrap();
        ledger.health_check().unwrap();
    }
}
