//! # magnetite-core: The routing core of `Magnetite`
//!
//! Everything between the [`Endpoint`](https://docs.rs/magnetite) facade
//! and the wire lives here:
//!
//! - [`Clock`]: wall-clock or virtual time, deferred message scheduling,
//!   and the `advance_time` synchronization barrier.
//! - [`NetworkCache`]: the bidirectional peer-handle ↔ address mapping.
//! - [`wire`]: the peer-to-peer message set and its framing.
//! - [`transport`]: TCP or TLS byte streams behind one strategy value.
//! - [`CoreActor`]: the router — peer table, subscription propagation,
//!   message forwarding, store attachment, recording.
//! - [`store`]: master and clone actors plus the application-facing
//!   [`Store`] handle.
//!
//! # Concurrency model
//!
//! Every component is a tokio task owning an MPSC mailbox; messages are
//! tagged enums, replies travel on `oneshot` channels, and status events
//! fan out on a `broadcast` channel. The only shared mutable state is the
//! clock's pending-message map behind a mutex.

pub mod cache;
pub mod clock;
mod error;
pub mod router;
pub mod store;
pub mod transport;
pub mod wire;
mod workers;

pub use cache::{NetworkCache, PeerHandle};
pub use clock::{Clock, Recipient, Tick, TimerMessage};
pub use error::CoreError;
pub use router::{CoreActor, CoreHandle, CoreOptions, CoreRequest};
pub use store::{BackendSpec, CloneSettings, Store};
pub use transport::{TlsConfig, Transport};
pub use workers::{Publisher, StatusSubscriber, Subscriber};

/// Fixed timeouts used by the core.
pub mod timeout {
    use std::time::Duration;

    /// How long `advance_time` waits for each recipient to acknowledge a
    /// sync point before giving up on it.
    pub const FRONTEND: Duration = Duration::from_secs(10);

    /// Cap on a single transport connection attempt.
    pub const CONNECT: Duration = Duration::from_secs(10);
}
