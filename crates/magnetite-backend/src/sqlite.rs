//! SQLite-backed durable store.
//!
//! One file per store, a single table of postcard-encoded blobs:
//!
//! ```text
//! CREATE TABLE store (
//!     key    BLOB PRIMARY KEY,
//!     value  BLOB NOT NULL,
//!     expiry INTEGER          -- nanoseconds since epoch, NULL = never
//! )
//! ```
//!
//! WAL journaling with `synchronous=FULL` gives each mutating statement
//! single-operation durability against process crash.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use magnetite_types::{Data, Snapshot, StoreEntry, Timestamp};

use crate::{Backend, BackendError, ops};

const STATEMENT_CREATE_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS store (key BLOB PRIMARY KEY, value BLOB NOT NULL, expiry INTEGER)";
const STATEMENT_PUT: &str = "INSERT OR REPLACE INTO store (key, value, expiry) VALUES (?, ?, ?)";
const STATEMENT_GET: &str = "SELECT value, expiry FROM store WHERE key = ?";
const STATEMENT_ERASE: &str = "DELETE FROM store WHERE key = ?";
const STATEMENT_EXPIRE: &str =
    "DELETE FROM store WHERE key = ? AND expiry IS NOT NULL AND expiry <= ?";
const STATEMENT_CLEAR: &str = "DELETE FROM store";
const STATEMENT_SIZE: &str = "SELECT count(*) FROM store WHERE expiry IS NULL OR expiry > ?";
const STATEMENT_SNAPSHOT: &str =
    "SELECT key, value, expiry FROM store WHERE expiry IS NULL OR expiry > ?";

/// A durable backend persisting to a single SQLite file.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "full")?;
        conn.execute(STATEMENT_CREATE_TABLE, [])?;
        Ok(Self { conn })
    }

    fn fetch(&self, key_blob: &[u8], now: Timestamp) -> Result<Option<StoreEntry>, BackendError> {
        let row = self
            .conn
            .prepare_cached(STATEMENT_GET)?
            .query_row(params![key_blob], |row| {
                let value: Vec<u8> = row.get(0)?;
                let expiry: Option<i64> = row.get(1)?;
                Ok((value, expiry))
            })
            .optional()?;
        let Some((value_blob, expiry)) = row else {
            return Ok(None);
        };
        let expiry = expiry.map(Timestamp::from_nanos);
        if expiry.is_some_and(|at| at <= now) {
            return Ok(None);
        }
        let value: Data = postcard::from_bytes(&value_blob)?;
        Ok(Some(StoreEntry::new(value, expiry)))
    }

    fn store(
        &mut self,
        key_blob: &[u8],
        value: &Data,
        expiry: Option<Timestamp>,
    ) -> Result<(), BackendError> {
        let value_blob = postcard::to_allocvec(value)?;
        self.conn.prepare_cached(STATEMENT_PUT)?.execute(params![
            key_blob,
            value_blob,
            expiry.map(Timestamp::as_nanos)
        ])?;
        Ok(())
    }
}

impl Backend for SqliteBackend {
    fn put(
        &mut self,
        key: Data,
        value: Data,
        expiry: Option<Timestamp>,
    ) -> Result<(), BackendError> {
        let key_blob = postcard::to_allocvec(&key)?;
        self.store(&key_blob, &value, expiry)
    }

    fn add(
        &mut self,
        key: Data,
        delta: &Data,
        expiry: Option<Timestamp>,
    ) -> Result<(), BackendError> {
        let key_blob = postcard::to_allocvec(&key)?;
        // Expiry is enforced by sweeps, not here; combine with whatever row
        // is present, same as the in-memory backend.
        let existing = self
            .fetch(&key_blob, Timestamp::from_nanos(i64::MIN))?
            .map(|e| e.value);
        let combined = ops::add(existing, delta)?;
        self.store(&key_blob, &combined, expiry)
    }

    fn subtract(
        &mut self,
        key: Data,
        delta: &Data,
        expiry: Option<Timestamp>,
    ) -> Result<(), BackendError> {
        let key_blob = postcard::to_allocvec(&key)?;
        let existing = self
            .fetch(&key_blob, Timestamp::from_nanos(i64::MIN))?
            .map(|e| e.value);
        let combined = ops::subtract(existing, delta)?;
        self.store(&key_blob, &combined, expiry)
    }

    fn erase(&mut self, key: &Data) -> Result<(), BackendError> {
        let key_blob = postcard::to_allocvec(key)?;
        self.conn
            .prepare_cached(STATEMENT_ERASE)?
            .execute(params![key_blob])?;
        Ok(())
    }

    fn expire(&mut self, key: &Data, now: Timestamp) -> Result<bool, BackendError> {
        let key_blob = postcard::to_allocvec(key)?;
        let removed = self
            .conn
            .prepare_cached(STATEMENT_EXPIRE)?
            .execute(params![key_blob, now.as_nanos()])?;
        Ok(removed > 0)
    }

    fn clear(&mut self) -> Result<(), BackendError> {
        self.conn.execute(STATEMENT_CLEAR, [])?;
        Ok(())
    }

    fn get(&self, key: &Data, now: Timestamp) -> Result<Data, BackendError> {
        let key_blob = postcard::to_allocvec(key)?;
        self.fetch(&key_blob, now)?
            .map(|entry| entry.value)
            .ok_or_else(|| BackendError::NoSuchKey(key.clone()))
    }

    fn exists(&self, key: &Data, now: Timestamp) -> Result<bool, BackendError> {
        let key_blob = postcard::to_allocvec(key)?;
        Ok(self.fetch(&key_blob, now)?.is_some())
    }

    fn size(&self, now: Timestamp) -> Result<u64, BackendError> {
        let count: i64 = self
            .conn
            .prepare_cached(STATEMENT_SIZE)?
            .query_row(params![now.as_nanos()], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn snapshot(&self, now: Timestamp) -> Result<Snapshot, BackendError> {
        let mut stmt = self.conn.prepare_cached(STATEMENT_SNAPSHOT)?;
        let rows = stmt.query_map(params![now.as_nanos()], |row| {
            let key: Vec<u8> = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            let expiry: Option<i64> = row.get(2)?;
            Ok((key, value, expiry))
        })?;

        let mut snapshot = Snapshot::new();
        for row in rows {
            let (key_blob, value_blob, expiry) = row?;
            let key: Data = postcard::from_bytes(&key_blob)?;
            let value: Data = postcard::from_bytes(&value_blob)?;
            snapshot.insert(
                key,
                StoreEntry::new(value, expiry.map(Timestamp::from_nanos)),
            );
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: Timestamp = Timestamp::from_nanos(1_000);
    const T2: Timestamp = Timestamp::from_nanos(2_500);

    fn open_temp() -> (tempfile::TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = SqliteBackend::open(dir.path().join("store.sqlite")).expect("open");
        (dir, backend)
    }

    #[test]
    fn basic_operations_match_memory_semantics() {
        let (_dir, mut b) = open_temp();
        b.put(Data::from("k"), Data::Count(1), None).unwrap();
        b.add(Data::from("k"), &Data::Count(2), None).unwrap();
        assert_eq!(b.get(&Data::from("k"), T0).unwrap(), Data::Count(3));

        b.subtract(Data::from("k"), &Data::Count(1), None).unwrap();
        assert_eq!(b.get(&Data::from("k"), T0).unwrap(), Data::Count(2));

        b.erase(&Data::from("k")).unwrap();
        assert!(matches!(
            b.get(&Data::from("k"), T0),
            Err(BackendError::NoSuchKey(_))
        ));
    }

    #[test]
    fn expired_entries_are_filtered_and_swept() {
        let (_dir, mut b) = open_temp();
        b.put(
            Data::from("k"),
            Data::Count(1),
            Some(Timestamp::from_nanos(2_000)),
        )
        .unwrap();

        assert!(b.exists(&Data::from("k"), T0).unwrap());
        assert!(!b.exists(&Data::from("k"), T2).unwrap());
        assert_eq!(b.size(T2).unwrap(), 0);

        assert!(b.expire(&Data::from("k"), T2).unwrap());
        assert!(!b.expire(&Data::from("k"), T2).unwrap());
    }

    #[test]
    fn type_clash_leaves_row_unchanged() {
        let (_dir, mut b) = open_temp();
        b.put(Data::from("k"), Data::from("hello"), None).unwrap();
        assert!(matches!(
            b.add(Data::from("k"), &Data::Integer(5), None),
            Err(BackendError::TypeClash { .. })
        ));
        assert_eq!(b.get(&Data::from("k"), T0).unwrap(), Data::from("hello"));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.sqlite");
        {
            let mut b = SqliteBackend::open(&path).expect("open");
            b.put(Data::from("persisted"), Data::Count(7), None).unwrap();
        }
        let b = SqliteBackend::open(&path).expect("reopen");
        assert_eq!(b.get(&Data::from("persisted"), T0).unwrap(), Data::Count(7));
        assert_eq!(b.size(T0).unwrap(), 1);
    }

    #[test]
    fn snapshot_round_trips_complex_values() {
        let (_dir, mut b) = open_temp();
        let vector = Data::Vector(vec![Data::from(1u64), Data::from("x")]);
        b.put(Data::from("v"), vector.clone(), None).unwrap();

        let snapshot = b.snapshot(T0).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&Data::from("v")).unwrap().value, vector);
    }
}
