//! # Magnetite
//!
//! Peer-to-peer communication for event-driven distributed applications.
//! Endpoints connect to one another, advertise topic subscriptions,
//! publish messages, and optionally host replicated key-value stores
//! (masters with clones).
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           Endpoint                             │
//! │  ┌────────┐   ┌──────────────┐   ┌─────────┐   ┌────────────┐  │
//! │  │ Clock  │   │ Core Router  │ ↔ │ Stores  │   │ Recording  │  │
//! │  │(virtual│   │(peers, subs, │   │(master/ │   │ (binary    │  │
//! │  │or real)│   │ forwarding)  │   │ clones) │   │  log)      │  │
//! │  └────────┘   └──────┬───────┘   └─────────┘   └────────────┘  │
//! └──────────────────────┼─────────────────────────────────────────┘
//!                 TCP / TLS peers
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use magnetite::{Config, Data, Endpoint, Timespan, Topic};
//!
//! let mut config = Config::default();
//! config.disable_ssl = true;
//! let a = Endpoint::new(config.clone())?;
//! let b = Endpoint::new(config)?;
//!
//! let port = a.listen("127.0.0.1", 0)?;
//! b.peer("127.0.0.1", port, Timespan::from_secs(5))?;
//!
//! let mut sub = b.make_subscriber(vec![Topic::from("/x")], 64);
//! a.publish(Topic::from("/x/y"), Data::Count(42));
//! let (topic, data) = sub.get().expect("message");
//! ```
//!
//! # Modules
//!
//! - **Facade**: [`Endpoint`], [`Config`] - construction, peering, shutdown
//! - **Messaging**: [`Publisher`], [`Subscriber`], [`StatusSubscriber`]
//! - **Stores**: [`Store`], [`BackendSpec`], [`CloneSettings`]
//! - **Recording**: [`RecordReader`], [`RecordWriter`]

mod config;
mod endpoint;
mod error;
mod fs;

pub use config::{Config, StoreDefaults, TlsFiles};
pub use endpoint::Endpoint;
pub use error::{EndpointError, Result};
pub use fs::{Filesystem, MemoryFilesystem, StdFilesystem};

// Re-export the vocabulary types so applications need only this crate.
pub use magnetite_backend::{Backend, BackendError, MemoryBackend, SqliteBackend};
pub use magnetite_core::{
    BackendSpec, Clock, CloneSettings, Publisher, Recipient, StatusSubscriber, Store, Subscriber,
    Tick, TimerMessage, TlsConfig,
};
pub use magnetite_record::{RecordError, RecordReader, RecordWriter};
pub use magnetite_types::{
    Command, Data, DataKind, EndpointId, ErrorCode, Filter, Message, NetworkInfo, PeerInfo,
    PeerStatus, Snapshot, StatusEvent, StoreEntry, Timespan, Timestamp, Topic,
};
