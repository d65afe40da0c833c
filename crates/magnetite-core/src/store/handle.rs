//! Application-facing store handle.

use tokio::sync::{mpsc, oneshot};

use magnetite_types::{Data, ErrorCode, Snapshot, Timestamp};

use super::{StoreApi, StoreInput};

/// A handle onto an attached master or clone store.
///
/// Handles are cheap to clone and can outlive interest in the store; once
/// the underlying actor is gone every call reports `shutting_down`.
/// Mutating calls against a clone succeed once the command is on its way
/// to the master — the local replica updates when the command comes back
/// on the replication stream.
#[derive(Debug, Clone)]
pub struct Store {
    name: String,
    tx: mpsc::UnboundedSender<StoreInput>,
    runtime: tokio::runtime::Handle,
}

impl Store {
    pub(crate) fn new(
        name: String,
        tx: mpsc::UnboundedSender<StoreInput>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self { name, tx, runtime }
    }

    /// The store's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets `key` to `value`, optionally expiring at `expiry`.
    pub fn put(
        &self,
        key: impl Into<Data>,
        value: impl Into<Data>,
        expiry: Option<Timestamp>,
    ) -> Result<(), ErrorCode> {
        self.request(|reply| {
            StoreApi::Put {
                key: key.into(),
                value: value.into(),
                expiry,
                reply,
            }
        })
    }

    /// Combines `value` into the entry at `key`.
    pub fn add(
        &self,
        key: impl Into<Data>,
        value: impl Into<Data>,
        expiry: Option<Timestamp>,
    ) -> Result<(), ErrorCode> {
        self.request(|reply| {
            StoreApi::Add {
                key: key.into(),
                value: value.into(),
                expiry,
                reply,
            }
        })
    }

    /// Removes `value` from the entry at `key` (numeric subtraction, set
    /// difference, table key removal).
    pub fn subtract(
        &self,
        key: impl Into<Data>,
        value: impl Into<Data>,
        expiry: Option<Timestamp>,
    ) -> Result<(), ErrorCode> {
        self.request(|reply| {
            StoreApi::Subtract {
                key: key.into(),
                value: value.into(),
                expiry,
                reply,
            }
        })
    }

    /// Deletes `key`.
    pub fn erase(&self, key: impl Into<Data>) -> Result<(), ErrorCode> {
        self.request(|reply| {
            StoreApi::Erase {
                key: key.into(),
                reply,
            }
        })
    }

    /// Drops every entry.
    pub fn clear(&self) -> Result<(), ErrorCode> {
        self.request(|reply| StoreApi::Clear { reply })
    }

    /// Reads the value at `key`.
    pub fn get(&self, key: impl Into<Data>) -> Result<Data, ErrorCode> {
        self.request(|reply| {
            StoreApi::Get {
                key: key.into(),
                reply,
            }
        })
    }

    /// Whether a live entry exists at `key`.
    pub fn exists(&self, key: impl Into<Data>) -> Result<bool, ErrorCode> {
        self.request(|reply| {
            StoreApi::Exists {
                key: key.into(),
                reply,
            }
        })
    }

    /// Number of live entries.
    pub fn size(&self) -> Result<u64, ErrorCode> {
        self.request(|reply| StoreApi::Size { reply })
    }

    /// Full state at the call instant.
    pub fn snapshot(&self) -> Result<Snapshot, ErrorCode> {
        self.request(|reply| StoreApi::Snapshot { reply })
    }

    /// Ships a request to the store actor and blocks on its reply.
    fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, ErrorCode>>) -> StoreApi,
    ) -> Result<T, ErrorCode> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreInput::Api(make(reply)))
            .map_err(|_| ErrorCode::ShuttingDown)?;
        self.runtime
            .block_on(rx)
            .map_err(|_| ErrorCode::ShuttingDown)?
    }
}
