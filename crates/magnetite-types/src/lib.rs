//! # magnetite-types: Core types for `Magnetite`
//!
//! This crate contains shared types used across the `Magnetite` system:
//! - The value model ([`Data`], [`StoreEntry`], [`Snapshot`])
//! - Routing keys ([`Topic`], [`Filter`])
//! - Temporal types ([`Timestamp`], [`Timespan`])
//! - Peering types ([`EndpointId`], [`NetworkInfo`], [`PeerInfo`], [`PeerStatus`])
//! - Store mutations ([`Command`], [`Message`])
//! - The wire-stable error taxonomy ([`ErrorCode`])
//! - Status events ([`StatusEvent`])

use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::ops::{Add, AddAssign, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod command;
mod data;
mod topic;

pub use command::{Command, Message, Snapshot, StoreEntry};
pub use data::{Data, DataKind, Port, PortProtocol, Subnet};
pub use topic::{Filter, Topic, filter_extend, filter_matches};

// ============================================================================
// Endpoint identity
// ============================================================================

/// Unique identifier for an endpoint (one per process-level broker instance).
///
/// Generated at endpoint construction and carried in handshakes and in the
/// visited set of forwarded messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId(Uuid);

impl EndpointId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Nil id, used as a placeholder before a handshake completes.
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Temporal types - nanosecond precision, virtual-clock friendly
// ============================================================================

/// A point in time, in nanoseconds since the Unix epoch.
///
/// Timestamps are plain integers so that a virtual clock can mint them
/// deterministically; nothing in the system assumes they came from the
/// wall clock.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Returns the timestamp as nanoseconds since the epoch.
    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Reads the wall clock.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

impl Add<Timespan> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Timespan) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign<Timespan> for Timestamp {
    fn add_assign(&mut self, rhs: Timespan) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for Timestamp {
    type Output = Timespan;

    fn sub(self, rhs: Timestamp) -> Timespan {
        Timespan(self.0.saturating_sub(rhs.0))
    }
}

/// A span of time in nanoseconds. May be negative when produced by
/// timestamp subtraction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timespan(i64);

impl Timespan {
    pub const ZERO: Timespan = Timespan(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Converts to a [`Duration`], clamping negative spans to zero.
    pub fn to_duration(self) -> Duration {
        if self.0 <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.0 as u64)
        }
    }
}

impl From<Duration> for Timespan {
    fn from(d: Duration) -> Self {
        Self(i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
    }
}

impl Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

impl Add for Timespan {
    type Output = Timespan;

    fn add(self, rhs: Timespan) -> Timespan {
        Timespan(self.0.saturating_add(rhs.0))
    }
}

// ============================================================================
// Peering
// ============================================================================

/// Address, port, and retry interval for reaching a remote endpoint.
///
/// Identity is `(address, port)` only: two infos that differ just in the
/// retry interval refer to the same peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Hostname or IP address of the remote endpoint.
    pub address: String,
    /// TCP port the remote endpoint listens on.
    pub port: u16,
    /// Interval between reconnection attempts. Zero disables retries.
    pub retry: Timespan,
}

impl NetworkInfo {
    pub fn new(address: impl Into<String>, port: u16, retry: Timespan) -> Self {
        Self {
            address: address.into(),
            port,
            retry,
        }
    }
}

impl PartialEq for NetworkInfo {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for NetworkInfo {}

impl Hash for NetworkInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl Display for NetworkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Lifecycle state of a peer relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Created but no connection attempt made yet.
    Initialized,
    /// A connection attempt is in flight.
    Connecting,
    /// Transport established, handshake pending.
    Connected,
    /// Handshake complete; messages flow.
    Peered,
    /// Connection lost or never established.
    Disconnected,
}

impl Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Initialized => "initialized",
            PeerStatus::Connecting => "connecting",
            PeerStatus::Connected => "connected",
            PeerStatus::Peered => "peered",
            PeerStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// A peer as reported by [`peers()`](https://docs.rs/magnetite): identity,
/// reachability info when known, and current status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The remote endpoint's id; [`EndpointId::nil`] until the handshake
    /// completes.
    pub id: EndpointId,
    /// Address info. `None` for inbound peers that never advertised one.
    pub network: Option<NetworkInfo>,
    /// Current lifecycle state.
    pub status: PeerStatus,
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Stable error codes carried in replies and status events.
///
/// The set is fixed; richer per-crate error types map onto it via their
/// `code()` methods so callers can match on behavior rather than message
/// strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorCode {
    #[error("no such key")]
    NoSuchKey,
    #[error("type clash")]
    TypeClash,
    #[error("no such master")]
    NoSuchMaster,
    #[error("no such clone")]
    NoSuchClone,
    #[error("backend failure")]
    BackendFailure,
    #[error("stale data")]
    StaleData,
    #[error("invalid peer")]
    PeerInvalid,
    #[error("peer unavailable")]
    PeerUnavailable,
    #[error("peer timeout")]
    PeerTimeout,
    #[error("incompatible peer")]
    PeerIncompatible,
    #[error("cannot open file")]
    CannotOpenFile,
    #[error("cannot write file")]
    CannotWriteFile,
    #[error("bad magic number")]
    BadMagic,
    #[error("unsupported format version")]
    UnsupportedVersion,
    #[error("truncated input")]
    FormatTruncated,
    #[error("request timed out")]
    RequestTimeout,
    #[error("shutting down")]
    ShuttingDown,
    #[error("unspecified error")]
    Unspecified,
}

// ============================================================================
// Status events
// ============================================================================

/// Out-of-band notifications delivered to status subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusEvent {
    /// A handshake completed and the peer entered the routing table.
    PeerAdded {
        peer: EndpointId,
        network: Option<NetworkInfo>,
    },
    /// An `unpeer` removed the peer.
    PeerRemoved {
        peer: EndpointId,
        network: Option<NetworkInfo>,
    },
    /// An established peer connection broke.
    PeerLost {
        peer: EndpointId,
        network: Option<NetworkInfo>,
    },
    /// A connection attempt failed (and may be retried).
    PeerUnreachable { network: NetworkInfo },
    /// A previously unknown endpoint introduced itself.
    EndpointDiscovered { peer: EndpointId },
    /// A clone lost contact with its master.
    MasterUnavailable { store: String },
    /// A clone's command stream went stale.
    CloneConnectionLost { store: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_info_identity_ignores_retry() {
        let a = NetworkInfo::new("127.0.0.1", 9999, Timespan::from_secs(5));
        let b = NetworkInfo::new("127.0.0.1", 9999, Timespan::ZERO);
        assert_eq!(a, b);

        let c = NetworkInfo::new("127.0.0.1", 9998, Timespan::from_secs(5));
        assert_ne!(a, c);
    }

    #[test]
    fn network_info_hash_consistent_with_eq() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(NetworkInfo::new("h", 1, Timespan::from_secs(30)), "x");
        assert_eq!(
            map.get(&NetworkInfo::new("h", 1, Timespan::ZERO)),
            Some(&"x")
        );
    }

    #[test]
    fn timestamp_arithmetic() {
        let t = Timestamp::from_nanos(1_000);
        let t2 = t + Timespan::from_nanos(500);
        assert_eq!(t2.as_nanos(), 1_500);
        assert_eq!((t2 - t).as_nanos(), 500);
        assert_eq!((t - t2).as_nanos(), -500);
    }

    #[test]
    fn timespan_duration_round_trip() {
        let span = Timespan::from(Duration::from_millis(250));
        assert_eq!(span.as_nanos(), 250_000_000);
        assert_eq!(span.to_duration(), Duration::from_millis(250));

        // Negative spans clamp to zero rather than panicking.
        let negative = Timestamp::ZERO - Timestamp::from_nanos(10);
        assert_eq!(negative.to_duration(), Duration::ZERO);
    }

    #[test]
    fn endpoint_ids_are_unique() {
        assert_ne!(EndpointId::random(), EndpointId::random());
        assert_eq!(EndpointId::nil(), EndpointId::nil());
    }

    #[test]
    fn error_code_round_trips_through_postcard() {
        let codes = [
            ErrorCode::NoSuchKey,
            ErrorCode::TypeClash,
            ErrorCode::StaleData,
            ErrorCode::Unspecified,
        ];
        for code in codes {
            let bytes = postcard::to_allocvec(&code).expect("serialize");
            let back: ErrorCode = postcard::from_bytes(&bytes).expect("deserialize");
            assert_eq!(code, back);
        }
    }
}
