//! Peer-to-peer message set and framing.
//!
//! Frames are `[len:u32 LE][postcard payload]` over whatever byte stream
//! the transport provides. The length prefix carries only the payload
//! size and is capped to keep a hostile peer from ballooning our buffers.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use magnetite_types::{Command, Data, EndpointId, Filter, Topic};

use crate::CoreError;

/// Version of the peer protocol. Mismatched peers are rejected during the
/// handshake with `peer_incompatible`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Everything peers say to each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Handshake: sent by both sides when a connection opens.
    Hello {
        id: EndpointId,
        version: u32,
        /// The sender's current subscription union.
        filter: Filter,
    },
    /// The sender's subscription union changed.
    FilterUpdate { filter: Filter },
    /// A routed data message. `visited` lists every endpoint that already
    /// forwarded it, for cycle suppression.
    Data {
        topic: Topic,
        data: Data,
        visited: Vec<EndpointId>,
    },
    /// A routed store command.
    Command {
        topic: Topic,
        command: Command,
        visited: Vec<EndpointId>,
    },
    /// Orderly goodbye before closing the connection.
    Goodbye,
}

/// Writes one frame.
pub async fn write_frame<W>(writer: &mut W, msg: &WireMessage) -> Result<(), CoreError>
where
    W: AsyncWrite + Unpin,
{
    let payload = postcard::to_allocvec(msg)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CoreError::FrameTooLarge {
            size: payload.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` signals a clean end of stream (EOF on the
/// length prefix boundary).
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WireMessage>, CoreError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CoreError::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_SIZE,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let msg = postcard::from_bytes(&payload)?;
    Ok(Some(msg))
}
