//! Length-framed routing header
//!
//! Every packet on the agent-gateway TCP hop and inside gateway-client
//! WebSocket binary frames starts with exactly 12 bytes in network byte
//! order:
//!
//! ```text
//! offset 0 : u32 payload_len
//! offset 4 : u32 client_id    (0 = broadcast to clients)
//! offset 8 : u32 backend_id   (0 = broadcast to agents / legacy default 1)
//! ```

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 12;

/// Larger payloads are a protocol error; the connection is closed.
pub const MAX_PAYLOAD_LEN: u32 = 10 * 1024 * 1024;

/// `client_id` value addressing every active client.
pub const BROADCAST_CLIENT: u32 = 0;
/// `backend_id` value addressing every connected agent.
pub const BROADCAST_BACKEND: u32 = 0;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame header truncated: {0} bytes")]
    Truncated(usize),

    #[error("payload length {0} exceeds limit")]
    TooLarge(u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u32,
    pub client_id: u32,
    pub backend_id: u32,
}

impl FrameHeader {
    pub fn new(payload_len: u32, client_id: u32, backend_id: u32) -> Self {
        FrameHeader {
            payload_len,
            client_id,
            backend_id,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[4..8].copy_from_slice(&self.client_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.backend_id.to_be_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::Truncated(data.len()));
        }

        let payload_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let client_id = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let backend_id = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        if payload_len > MAX_PAYLOAD_LEN {
            return Err(FrameError::TooLarge(payload_len));
        }

        Ok(FrameHeader {
            payload_len,
            client_id,
            backend_id,
        })
    }
}

/// A routed packet: header plus immutable payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(client_id: u32, backend_id: u32, payload: Bytes) -> Self {
        Frame {
            header: FrameHeader::new(payload.len() as u32, client_id, backend_id),
            payload,
        }
    }

    /// Serializes header + payload into one contiguous buffer, as sent on
    /// the TCP hop or as a WebSocket binary frame body.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parses a whole framed packet (e.g. a WebSocket binary body). The
    /// body past the 12-byte header must be exactly `payload_len` bytes.
    pub fn from_bytes(data: Bytes) -> Result<Self, FrameError> {
        let header = FrameHeader::decode(&data)?;
        let body_len = data.len() - HEADER_LEN;
        if header.payload_len as usize != body_len {
            return Err(FrameError::Truncated(body_len));
        }
        Ok(Frame {
            header,
            payload: data.slice(HEADER_LEN..),
        })
    }
}

/// Reads one framed packet from a stream. Returns `Ok(None)` on a clean
/// EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }

    Ok(Some(Frame {
        header,
        payload: Bytes::from(payload),
    }))
}

/// Writes one framed packet, optionally inserting a stream-tag byte
/// between header and payload. The tag byte counts toward `payload_len`.
pub async fn write_frame<W>(
    writer: &mut W,
    client_id: u32,
    backend_id: u32,
    tag: Option<u8>,
    payload: &[u8],
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let tag_len = if tag.is_some() { 1 } else { 0 };
    let header = FrameHeader::new((payload.len() + tag_len) as u32, client_id, backend_id);

    let mut buf = BytesMut::with_capacity(HEADER_LEN + tag_len + payload.len());
    buf.extend_from_slice(&header.encode());
    if let Some(t) = tag {
        buf.extend_from_slice(&[t]);
    }
    buf.extend_from_slice(payload);

    writer.write_all(&buf).await?;
    Ok(())
}
