//! Bidirectional peer-handle ↔ address cache.
//!
//! The router allocates a [`PeerHandle`] per transport connection and
//! records here how that handle maps to a remote `(address, port)`. The
//! two maps stay mutual inverses; in-flight resolutions live in the
//! router's pending-peer table until the connection lands, at which point
//! [`NetworkCache::add`] publishes the pair.

use std::collections::HashMap;
use std::fmt::{self, Display};

use magnetite_types::NetworkInfo;

/// Opaque handle for one peer connection, unique per core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(pub(crate) u64);

impl Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Two mutually inverse maps between handles and network addresses.
#[derive(Debug, Default)]
pub struct NetworkCache {
    by_handle: HashMap<PeerHandle, NetworkInfo>,
    by_info: HashMap<NetworkInfo, PeerHandle>,
}

impl NetworkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a resolved pair in both directions, evicting any stale
    /// mapping either side had.
    pub fn add(&mut self, handle: PeerHandle, info: NetworkInfo) {
        if let Some(old_info) = self.by_handle.insert(handle, info.clone()) {
            self.by_info.remove(&old_info);
        }
        if let Some(old_handle) = self.by_info.insert(info, handle) {
            if old_handle != handle {
                self.by_handle.remove(&old_handle);
            }
        }
    }

    /// Looks up the handle connected to `info`, if any.
    pub fn find_handle(&self, info: &NetworkInfo) -> Option<PeerHandle> {
        self.by_info.get(info).copied()
    }

    /// Looks up the address a handle was resolved from, if any.
    pub fn find_info(&self, handle: PeerHandle) -> Option<&NetworkInfo> {
        self.by_handle.get(&handle)
    }

    /// Drops a handle from both maps, returning its address if known.
    pub fn remove(&mut self, handle: PeerHandle) -> Option<NetworkInfo> {
        let info = self.by_handle.remove(&handle)?;
        self.by_info.remove(&info);
        Some(info)
    }
}
