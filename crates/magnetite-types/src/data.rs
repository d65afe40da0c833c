//! The `Data` value model.
//!
//! `Data` is the single heterogeneous value type that flows through
//! publish/subscribe messages and the key-value stores. Every variant is
//! serializable, and the whole type is totally ordered so values can serve
//! as set elements and table keys. `Real` values order via
//! [`f64::total_cmp`], which is what makes the total order possible at all.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::{Timespan, Timestamp};

/// An IP network prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subnet {
    /// Base address of the network.
    pub address: IpAddr,
    /// Prefix length in bits.
    pub prefix: u8,
}

impl Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// Transport protocol tag for [`Port`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PortProtocol {
    Unknown,
    Tcp,
    Udp,
    Icmp,
}

/// A transport port plus its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Port {
    pub number: u16,
    pub protocol: PortProtocol,
}

impl Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            PortProtocol::Unknown => "?",
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
            PortProtocol::Icmp => "icmp",
        };
        write!(f, "{}/{}", self.number, proto)
    }
}

/// The tagged value sum carried by messages and stored in data stores.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum Data {
    /// The absent value.
    #[default]
    None,
    Boolean(bool),
    /// Unsigned 64-bit counter.
    Count(u64),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Double-precision float. Ordered by `total_cmp`.
    Real(f64),
    Text(String),
    Address(IpAddr),
    Subnet(Subnet),
    Port(Port),
    Timestamp(Timestamp),
    Timespan(Timespan),
    /// A named enumerator from a user-defined enum type.
    Enum(String),
    /// Unordered collection of unique values.
    Set(BTreeSet<Data>),
    /// Mapping from values to values.
    Table(BTreeMap<Data, Data>),
    /// Ordered sequence of values.
    Vector(Vec<Data>),
}

/// Discriminant-only view of [`Data`], used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    None,
    Boolean,
    Count,
    Integer,
    Real,
    Text,
    Address,
    Subnet,
    Port,
    Timestamp,
    Timespan,
    Enum,
    Set,
    Table,
    Vector,
}

impl Data {
    /// Returns the variant discriminant.
    pub fn kind(&self) -> DataKind {
        match self {
            Data::None => DataKind::None,
            Data::Boolean(_) => DataKind::Boolean,
            Data::Count(_) => DataKind::Count,
            Data::Integer(_) => DataKind::Integer,
            Data::Real(_) => DataKind::Real,
            Data::Text(_) => DataKind::Text,
            Data::Address(_) => DataKind::Address,
            Data::Subnet(_) => DataKind::Subnet,
            Data::Port(_) => DataKind::Port,
            Data::Timestamp(_) => DataKind::Timestamp,
            Data::Timespan(_) => DataKind::Timespan,
            Data::Enum(_) => DataKind::Enum,
            Data::Set(_) => DataKind::Set,
            Data::Table(_) => DataKind::Table,
            Data::Vector(_) => DataKind::Vector,
        }
    }

    /// Variant rank for cross-variant ordering. Values of different
    /// variants order by rank; values of the same variant order by value.
    fn rank(&self) -> u8 {
        match self {
            Data::None => 0,
            Data::Boolean(_) => 1,
            Data::Count(_) => 2,
            Data::Integer(_) => 3,
            Data::Real(_) => 4,
            Data::Text(_) => 5,
            Data::Address(_) => 6,
            Data::Subnet(_) => 7,
            Data::Port(_) => 8,
            Data::Timestamp(_) => 9,
            Data::Timespan(_) => 10,
            Data::Enum(_) => 11,
            Data::Set(_) => 12,
            Data::Table(_) => 13,
            Data::Vector(_) => 14,
        }
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Data {}

impl PartialOrd for Data {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Data {
    fn cmp(&self, other: &Self) -> Ordering {
        use Data::{
            Address, Boolean, Count, Enum, Integer, Port, Real, Set, Subnet, Table, Text,
            Timespan, Timestamp, Vector,
        };
        match (self, other) {
            (Data::None, Data::None) => Ordering::Equal,
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Count(a), Count(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Real(a), Real(b)) => a.total_cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Address(a), Address(b)) => a.cmp(b),
            (Subnet(a), Subnet(b)) => a.cmp(b),
            (Port(a), Port(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Timespan(a), Timespan(b)) => a.cmp(b),
            (Enum(a), Enum(b)) => a.cmp(b),
            (Set(a), Set(b)) => a.cmp(b),
            (Table(a), Table(b)) => a.cmp(b),
            (Vector(a), Vector(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Data::None => f.write_str("nil"),
            Data::Boolean(b) => write!(f, "{b}"),
            Data::Count(c) => write!(f, "{c}"),
            Data::Integer(i) => write!(f, "{i:+}"),
            Data::Real(r) => write!(f, "{r}"),
            Data::Text(s) => write!(f, "{s:?}"),
            Data::Address(a) => write!(f, "{a}"),
            Data::Subnet(s) => write!(f, "{s}"),
            Data::Port(p) => write!(f, "{p}"),
            Data::Timestamp(t) => write!(f, "{t}"),
            Data::Timespan(t) => write!(f, "{t}"),
            Data::Enum(e) => f.write_str(e),
            Data::Set(xs) => {
                f.write_str("{")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x}")?;
                }
                f.write_str("}")
            }
            Data::Table(xs) => {
                f.write_str("{")?;
                for (i, (k, v)) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k} -> {v}")?;
                }
                f.write_str("}")
            }
            Data::Vector(xs) => {
                f.write_str("(")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<bool> for Data {
    fn from(v: bool) -> Self {
        Data::Boolean(v)
    }
}

impl From<u64> for Data {
    fn from(v: u64) -> Self {
        Data::Count(v)
    }
}

impl From<i64> for Data {
    fn from(v: i64) -> Self {
        Data::Integer(v)
    }
}

impl From<f64> for Data {
    fn from(v: f64) -> Self {
        Data::Real(v)
    }
}

impl From<&str> for Data {
    fn from(v: &str) -> Self {
        Data::Text(v.to_string())
    }
}

impl From<String> for Data {
    fn from(v: String) -> Self {
        Data::Text(v)
    }
}

impl From<IpAddr> for Data {
    fn from(v: IpAddr) -> Self {
        Data::Address(v)
    }
}
