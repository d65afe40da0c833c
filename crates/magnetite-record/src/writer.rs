//! Buffered recording writer.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use magnetite_types::{Message, Topic};

use crate::{
    HEADER_SIZE, MAGIC, RecordError, TAG_COMMAND_MESSAGE, TAG_DATA_MESSAGE, TAG_NEW_TOPIC, VERSION,
};

/// Buffer size at which the writer flushes to disk.
const FLUSH_THRESHOLD: usize = 1024;

/// Appends messages to a recording file, interning topics on first use.
///
/// Entries accumulate in an in-memory buffer and hit the file once the
/// buffer exceeds the flush threshold, on an explicit [`flush`](Self::flush),
/// or on drop (where failures are logged, not raised).
pub struct RecordWriter {
    file: File,
    path: PathBuf,
    buf: Vec<u8>,
    topic_table: Vec<Topic>,
}

impl RecordWriter {
    /// Creates the file at `path` and writes the format header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::create(&path).map_err(|source| RecordError::CannotOpen {
            path: path.clone(),
            source,
        })?;

        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&MAGIC.to_le_bytes());
        header[4..].copy_from_slice(&VERSION.to_le_bytes());
        file.write_all(&header)
            .and_then(|()| file.flush())
            .map_err(|source| RecordError::CannotWrite {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            file,
            path,
            buf: Vec::with_capacity(2 * FLUSH_THRESHOLD),
            topic_table: Vec::new(),
        })
    }

    /// Appends one message, emitting a `new_topic` entry first if its topic
    /// has not been seen.
    pub fn write(&mut self, msg: &Message) -> Result<(), RecordError> {
        let topic_id = self.topic_id(msg.topic())?;
        let (tag, payload) = match msg {
            Message::Data(_, data) => (TAG_DATA_MESSAGE, postcard::to_allocvec(data)?),
            Message::Command(_, cmd) => (TAG_COMMAND_MESSAGE, postcard::to_allocvec(cmd)?),
        };
        self.buf.push(tag);
        self.buf.extend_from_slice(&topic_id.to_le_bytes());
        self.buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&payload);

        if self.buf.len() >= FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes buffered entries to the file. A no-op when the buffer is
    /// empty.
    pub fn flush(&mut self) -> Result<(), RecordError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.file
            .write_all(&self.buf)
            .map_err(|source| RecordError::CannotWrite {
                path: self.path.clone(),
                source,
            })?;
        self.buf.clear();
        Ok(())
    }

    /// Topics interned so far, in id order.
    pub fn topics(&self) -> &[Topic] {
        &self.topic_table
    }

    /// Returns the id of `topic`, interning it (and buffering a
    /// `new_topic` entry) on first sight.
    fn topic_id(&mut self, topic: &Topic) -> Result<u16, RecordError> {
        if let Some(pos) = self.topic_table.iter().position(|t| t == topic) {
            return Ok(pos as u16);
        }
        if self.topic_table.len() > usize::from(u16::MAX) {
            return Err(RecordError::TopicTableFull(self.topic_table.len()));
        }
        let bytes = topic.as_str().as_bytes();
        self.buf.push(TAG_NEW_TOPIC);
        self.buf
            .extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(bytes);

        let id = self.topic_table.len() as u16;
        self.topic_table.push(topic.clone());
        Ok(id)
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::error!(path = %self.path.display(), %err, "flushing recording in drop failed");
        }
    }
}
