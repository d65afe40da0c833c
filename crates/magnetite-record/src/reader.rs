//! Memory-mapped recording reader.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use magnetite_types::{Command, Data, Message, Topic};

use crate::{
    HEADER_SIZE, MAGIC, RecordError, TAG_COMMAND_MESSAGE, TAG_DATA_MESSAGE, TAG_NEW_TOPIC, VERSION,
};

/// Outcome of consuming a single file entry.
enum Entry {
    /// A `new_topic` entry; the topic table was updated.
    Topic,
    /// A message entry that was skipped without decoding its payload.
    Skipped,
    /// A fully decoded message entry.
    Decoded(Message),
}

/// Reads a recording file via a memory mapping.
///
/// The mapping and file descriptor are released on drop. The topic table
/// grows as `new_topic` entries are encountered (by [`read`](Self::read)
/// and [`skip`](Self::skip) alike); after a [`rewind`](Self::rewind) the
/// table is sealed and re-encountered entries are validated against it
/// instead of appended.
pub struct RecordReader {
    mmap: Mmap,
    pos: usize,
    topic_table: Vec<Topic>,
    data_entries: usize,
    command_entries: usize,
    sealed: bool,
}

impl RecordReader {
    /// Opens and maps the file at `path`, validating the header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| RecordError::CannotOpen {
            path: path.to_path_buf(),
            source,
        })?;
        // SAFETY: the mapping is read-only and private to this reader;
        // recording files are finished artifacts that nothing truncates
        // while a reader holds them.
        #[allow(unsafe_code)]
        let mmap = unsafe {
            Mmap::map(&file).map_err(|source| RecordError::CannotOpen {
                path: path.to_path_buf(),
                source,
            })?
        };

        if mmap.len() < HEADER_SIZE {
            return Err(RecordError::Truncated);
        }
        let found = u32::from_le_bytes(mmap[0..4].try_into().expect("4-byte slice"));
        if found != MAGIC {
            return Err(RecordError::BadMagic {
                expected: MAGIC,
                found,
            });
        }
        let version = u32::from_le_bytes(mmap[4..8].try_into().expect("4-byte slice"));
        if version != VERSION {
            return Err(RecordError::UnsupportedVersion { version });
        }

        Ok(Self {
            mmap,
            pos: HEADER_SIZE,
            topic_table: Vec::new(),
            data_entries: 0,
            command_entries: 0,
            sealed: false,
        })
    }

    /// True once every entry has been consumed.
    pub fn at_end(&self) -> bool {
        self.pos >= self.mmap.len()
    }

    /// Resets the read position to the first entry.
    ///
    /// Only meaningful once [`at_end`](Self::at_end); a rewind mid-file is
    /// ignored. Counters restart; the topic table is kept and sealed.
    pub fn rewind(&mut self) {
        if !self.at_end() {
            return;
        }
        self.pos = HEADER_SIZE;
        self.data_entries = 0;
        self.command_entries = 0;
        self.sealed = true;
    }

    /// Decodes the next message, transparently consuming `new_topic`
    /// entries along the way.
    pub fn read(&mut self) -> Result<Message, RecordError> {
        loop {
            match self.step(true)? {
                Entry::Topic | Entry::Skipped => {}
                Entry::Decoded(msg) => return Ok(msg),
            }
        }
    }

    /// Advances past the next message without materializing its payload.
    pub fn skip(&mut self) -> Result<(), RecordError> {
        loop {
            match self.step(false)? {
                Entry::Topic => {}
                Entry::Skipped | Entry::Decoded(_) => return Ok(()),
            }
        }
    }

    /// Consumes all remaining entries, updating topic table and counters.
    pub fn skip_to_end(&mut self) -> Result<(), RecordError> {
        while !self.at_end() {
            self.skip()?;
        }
        Ok(())
    }

    /// Topics interned so far, in id order.
    pub fn topics(&self) -> &[Topic] {
        &self.topic_table
    }

    /// Total message entries seen since open or rewind.
    pub fn entries(&self) -> usize {
        self.data_entries + self.command_entries
    }

    /// Data message entries seen since open or rewind.
    pub fn data_entries(&self) -> usize {
        self.data_entries
    }

    /// Command message entries seen since open or rewind.
    pub fn command_entries(&self) -> usize {
        self.command_entries
    }

    fn take(&mut self, n: usize) -> Result<&[u8], RecordError> {
        if self.pos + n > self.mmap.len() {
            return Err(RecordError::Truncated);
        }
        let slice = &self.mmap[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u16(&mut self) -> Result<u16, RecordError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().expect("2-byte slice")))
    }

    fn take_u32(&mut self) -> Result<u32, RecordError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    /// Consumes one entry, decoding message payloads only when `decode` is
    /// set. Counters and the topic table are maintained either way.
    fn step(&mut self, decode: bool) -> Result<Entry, RecordError> {
        if self.at_end() {
            return Err(RecordError::Truncated);
        }
        let tag = self.take(1)?[0];
        match tag {
            TAG_NEW_TOPIC => {
                let len = self.take_u32()? as usize;
                let bytes = self.take(len)?;
                let text = std::str::from_utf8(bytes).map_err(|_| RecordError::Truncated)?;
                let topic = Topic::from(text);
                if !self.sealed {
                    self.topic_table.push(topic);
                }
                Ok(Entry::Topic)
            }
            TAG_DATA_MESSAGE | TAG_COMMAND_MESSAGE => {
                let topic_id = self.take_u16()?;
                let len = self.take_u32()? as usize;
                let payload_start = self.pos;
                self.take(len)?;
                let topic = self
                    .topic_table
                    .get(usize::from(topic_id))
                    .cloned()
                    .ok_or(RecordError::TopicIdOutOfRange {
                        id: topic_id,
                        table_len: self.topic_table.len(),
                    })?;

                if tag == TAG_DATA_MESSAGE {
                    self.data_entries += 1;
                } else {
                    self.command_entries += 1;
                }
                if !decode {
                    return Ok(Entry::Skipped);
                }

                let payload = &self.mmap[payload_start..payload_start + len];
                let msg = if tag == TAG_DATA_MESSAGE {
                    let data: Data = postcard::from_bytes(payload)?;
                    Message::Data(topic, data)
                } else {
                    let cmd: Command = postcard::from_bytes(payload)?;
                    Message::Command(topic, cmd)
                };
                Ok(Entry::Decoded(msg))
            }
            tag => Err(RecordError::UnknownEntryType { tag }),
        }
    }
}
