//! Replicated key-value stores: master and clone actors plus the
//! application-facing [`Store`] handle.
//!
//! Stores ride on top of pub/sub. Every store named `s` owns two reserved
//! topics: commands *to* the master travel on `s/data/master`, and the
//! master's committed command stream (plus snapshots) travels on
//! `s/data/clone`. Attaching a master or clone subscribes the endpoint to
//! the respective topic, so replication works across peers with no extra
//! wiring.

use std::path::PathBuf;

use tokio::sync::oneshot;

use magnetite_backend::{Backend, BackendError, MemoryBackend, SqliteBackend};
use magnetite_types::{Command, Data, ErrorCode, Snapshot, Timespan, Timestamp};

mod clone;
mod handle;
mod master;

pub(crate) use clone::CloneActor;
pub use handle::Store;
pub(crate) use master::MasterActor;

/// Which backend a master should own.
#[derive(Debug, Clone)]
pub enum BackendSpec {
    /// Volatile in-memory state.
    Memory,
    /// Durable single-file SQLite state at `path`.
    Sqlite { path: PathBuf },
}

impl BackendSpec {
    pub(crate) fn open(&self) -> Result<Box<dyn Backend>, BackendError> {
        match self {
            BackendSpec::Memory => Ok(Box::new(MemoryBackend::new())),
            BackendSpec::Sqlite { path } => Ok(Box::new(SqliteBackend::open(path)?)),
        }
    }
}

/// Timing knobs for clone attachment.
#[derive(Debug, Clone, Copy)]
pub struct CloneSettings {
    /// How often a disconnected clone re-asks for its master.
    pub resync_interval: Timespan,
    /// Master silence after which the clone flags itself stale.
    pub stale_interval: Timespan,
    /// How long commands buffered during bootstrap stay relevant.
    pub mutation_buffer_interval: Timespan,
}

impl Default for CloneSettings {
    fn default() -> Self {
        Self {
            resync_interval: Timespan::from_secs(10),
            stale_interval: Timespan::from_secs(10),
            mutation_buffer_interval: Timespan::from_secs(120),
        }
    }
}

/// Mailbox input for a store actor.
#[derive(Debug)]
pub(crate) enum StoreInput {
    /// A command routed off the store's reserved topic.
    Command(Command),
    /// A request from the application-facing handle.
    Api(StoreApi),
    /// Stop processing and exit.
    Terminate,
}

/// Application requests against a store.
#[derive(Debug)]
pub(crate) enum StoreApi {
    Put {
        key: Data,
        value: Data,
        expiry: Option<Timestamp>,
        reply: oneshot::Sender<Result<(), ErrorCode>>,
    },
    Add {
        key: Data,
        value: Data,
        expiry: Option<Timestamp>,
        reply: oneshot::Sender<Result<(), ErrorCode>>,
    },
    Subtract {
        key: Data,
        value: Data,
        expiry: Option<Timestamp>,
        reply: oneshot::Sender<Result<(), ErrorCode>>,
    },
    Erase {
        key: Data,
        reply: oneshot::Sender<Result<(), ErrorCode>>,
    },
    Clear {
        reply: oneshot::Sender<Result<(), ErrorCode>>,
    },
    Get {
        key: Data,
        reply: oneshot::Sender<Result<Data, ErrorCode>>,
    },
    Exists {
        key: Data,
        reply: oneshot::Sender<Result<bool, ErrorCode>>,
    },
    Size {
        reply: oneshot::Sender<Result<u64, ErrorCode>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<Snapshot, ErrorCode>>,
    },
}

/// Applies one replicable mutation to a backend.
///
/// `Expire` is deliberately absent: masters decide expiry via their own
/// sweep ticks, and clones honor a replicated `Expire` as a plain erase
/// (their clock may trail the master's).
pub(crate) fn apply_mutation(
    backend: &mut dyn Backend,
    cmd: Command,
) -> Result<(), BackendError> {
    match cmd {
        Command::Put { key, value, expiry } => backend.put(key, value, expiry),
        Command::Add { key, value, expiry } => backend.add(key, &value, expiry),
        Command::Subtract { key, value, expiry } => backend.subtract(key, &value, expiry),
        Command::Erase { key } => backend.erase(&key),
        Command::Clear => backend.clear(),
        Command::Expire { .. } | Command::SnapshotRequest { .. } | Command::SnapshotSync { .. } => {
            Ok(())
        }
    }
}

/// Serves a read-only API request against a backend. Shared verbatim by
/// masters and clones.
pub(crate) fn serve_read(backend: &dyn Backend, api: StoreApi, now: Timestamp) -> Option<StoreApi> {
    match api {
        StoreApi::Get { key, reply } => {
            let result = backend.get(&key, now).map_err(|e| e.code());
            let _ = reply.send(result);
            None
        }
        StoreApi::Exists { key, reply } => {
            let result = backend.exists(&key, now).map_err(|e| e.code());
            let _ = reply.send(result);
            None
        }
        StoreApi::Size { reply } => {
            let result = backend.size(now).map_err(|e| e.code());
            let _ = reply.send(result);
            None
        }
        StoreApi::Snapshot { reply } => {
            let result = backend.snapshot(now).map_err(|e| e.code());
            let _ = reply.send(result);
            None
        }
        other => Some(other),
    }
}
