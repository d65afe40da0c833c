//! # magnetite-backend: Store backends for `Magnetite`
//!
//! A [`Backend`] holds the state of one key-value store: a mapping from
//! [`Data`] keys to values with optional absolute expiry. Masters own one
//! backend each; clones always use the in-memory implementation.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryBackend`]: a `BTreeMap`, no durability.
//! - [`SqliteBackend`]: a single SQLite file with per-operation durability.
//!
//! Expiry is enforced lazily. Reads (`get`, `exists`, `size`, `snapshot`)
//! take the caller's notion of *now* and filter entries whose expiry has
//! passed; [`Backend::expire`] actually removes them. Passing time in
//! explicitly keeps backends deterministic under a virtual clock.

use magnetite_types::{Data, Snapshot, Timestamp};

mod error;
mod memory;
mod ops;
mod sqlite;

pub use error::BackendError;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Key-value storage contract shared by masters and clones.
pub trait Backend: Send {
    /// Unconditionally sets `key` to `(value, expiry)`.
    fn put(
        &mut self,
        key: Data,
        value: Data,
        expiry: Option<Timestamp>,
    ) -> Result<(), BackendError>;

    /// Combines `delta` into the entry at `key`. An absent key behaves as
    /// the identity of `delta`'s type (0, empty string, empty collection).
    ///
    /// # Errors
    ///
    /// [`BackendError::TypeClash`] when the operand types are incompatible;
    /// the entry is left unchanged.
    fn add(
        &mut self,
        key: Data,
        delta: &Data,
        expiry: Option<Timestamp>,
    ) -> Result<(), BackendError>;

    /// Inverse of [`add`](Backend::add) where meaningful: numeric
    /// subtraction, set difference, table key removal.
    fn subtract(
        &mut self,
        key: Data,
        delta: &Data,
        expiry: Option<Timestamp>,
    ) -> Result<(), BackendError>;

    /// Deletes `key`. Erasing an absent key is not an error.
    fn erase(&mut self, key: &Data) -> Result<(), BackendError>;

    /// Removes `key` iff it exists with an expiry at or before `now`.
    /// Returns whether an entry was removed.
    fn expire(&mut self, key: &Data, now: Timestamp) -> Result<bool, BackendError>;

    /// Drops every entry.
    fn clear(&mut self) -> Result<(), BackendError>;

    /// Returns the live value at `key`.
    ///
    /// # Errors
    ///
    /// [`BackendError::NoSuchKey`] when the key is absent or expired.
    fn get(&self, key: &Data, now: Timestamp) -> Result<Data, BackendError>;

    /// Whether a live entry exists at `key`.
    fn exists(&self, key: &Data, now: Timestamp) -> Result<bool, BackendError>;

    /// Number of live entries.
    fn size(&self, now: Timestamp) -> Result<u64, BackendError>;

    /// Full map of live entries at the call instant.
    fn snapshot(&self, now: Timestamp) -> Result<Snapshot, BackendError>;
}
