//! Store commands and the message sum carried by the pub/sub layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Data, EndpointId, Timestamp, Topic};

/// One entry of a store: the value and its optional absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub value: Data,
    pub expiry: Option<Timestamp>,
}

impl StoreEntry {
    pub fn new(value: Data, expiry: Option<Timestamp>) -> Self {
        Self { value, expiry }
    }
}

/// Full state of a store at an instant: every live key with its entry.
pub type Snapshot = BTreeMap<Data, StoreEntry>;

/// A store mutation or synchronization message, published on the reserved
/// store topics and replicated from masters to clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Unconditionally set `key` to `value`.
    Put {
        key: Data,
        value: Data,
        expiry: Option<Timestamp>,
    },
    /// Combine `value` into the existing entry (numeric addition,
    /// string/vector concatenation, set/table union).
    Add {
        key: Data,
        value: Data,
        expiry: Option<Timestamp>,
    },
    /// Inverse of `Add` where meaningful (numeric subtraction, set
    /// difference, table key removal).
    Subtract {
        key: Data,
        value: Data,
        expiry: Option<Timestamp>,
    },
    /// Delete `key`. Idempotent.
    Erase { key: Data },
    /// Erase `key` iff its expiry has passed.
    Expire { key: Data },
    /// Drop every entry.
    Clear,
    /// A clone asking its master for a full snapshot.
    SnapshotRequest { requester: EndpointId },
    /// Master reply: full state plus the command sequence number it
    /// reflects.
    SnapshotSync { snapshot: Snapshot, seq: u64 },
}

impl Command {
    /// True for commands that change store state and therefore flow from
    /// the master to its clones.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Command::Put { .. }
                | Command::Add { .. }
                | Command::Subtract { .. }
                | Command::Erase { .. }
                | Command::Expire { .. }
                | Command::Clear
        )
    }
}

/// A published message: application data or a store command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Data(Topic, Data),
    Command(Topic, Command),
}

impl Message {
    pub fn topic(&self) -> &Topic {
        match self {
            Message::Data(t, _) | Message::Command(t, _) => t,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Message::Data(..))
    }
}
