//! # magnetite-record: Message recording files
//!
//! A recording file is a binary log of published messages with interned
//! topics, suitable for deterministic replay under a virtual clock.
//!
//! # File Format
//!
//! ```text
//! [magic:u32][version:u32][entry]...
//!
//! entry := [0x00][len:u32][topic bytes]          -- new_topic
//!        | [0x01][topic_id:u16][len:u32][Data]   -- data_message
//!        | [0x02][topic_id:u16][len:u32][Command]-- command_message
//! ```
//!
//! All integers are little-endian; payloads are postcard-encoded. A
//! `new_topic` entry appends to the topic table, and ids are assigned in
//! insertion order starting at 0, so a reader reconstructs the table by
//! replaying entries in order.

mod error;
mod reader;
mod writer;

pub use error::RecordError;
pub use reader::RecordReader;
pub use writer::RecordWriter;

/// Identifies a recording file. Spells "MGNT".
pub const MAGIC: u32 = 0x4D47_4E54;

/// Current format version. Readers reject anything else.
pub const VERSION: u32 = 1;

/// Size of the file header in bytes: magic + version.
pub const HEADER_SIZE: usize = 8;

/// Entry tags.
pub(crate) const TAG_NEW_TOPIC: u8 = 0;
pub(crate) const TAG_DATA_MESSAGE: u8 = 1;
pub(crate) const TAG_COMMAND_MESSAGE: u8 = 2;
