//! Streaming protocol frames.
//!
//! Every frame is `[length: 4 bytes BE][type: 1 byte][payload]` where the
//! length counts the type byte plus the payload.

use crate::error::{TypesError, TypesResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body (type byte plus payload)
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Client greeting naming a chain and a start block
    Hello = 0,
    /// Client request for the chain list
    ListChains = 1,
    /// Server reply with the chain list
    Chains = 2,
    /// Compressed newline-delimited block records
    Blocks = 10,
    /// Server status notice
    Status = 20,
    /// Server error; the connection is closed afterwards
    ServerError = 255,
}

impl TryFrom<u8> for FrameType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(Self::Hello),
            1 => Ok(Self::ListChains),
            2 => Ok(Self::Chains),
            10 => Ok(Self::Blocks),
            20 => Ok(Self::Status),
            255 => Ok(Self::ServerError),
            _ => Err(()),
        }
    }
}

/// Client greeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Chain to stream
    pub chain_id: u64,
    /// First block wanted; 0 or absent means block 1
    #[serde(default)]
    pub from_block: u64,
}

/// Chain entry of a chain listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    /// Chain ID
    pub chain_id: u64,
    /// Display name
    pub name: String,
    /// Latest block ingested
    pub latest_block: u64,
}

/// Status notice, e.g. `live` once a session reaches the tip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Status keyword
    pub status: String,
    /// Last block sent before the notice
    pub head_block: u64,
}

/// Error notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Human-readable reason
    pub message: String,
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Create a frame carrying a JSON payload
    pub fn json<T: Serialize>(frame_type: FrameType, value: &T) -> TypesResult<Self> {
        Ok(Self::new(frame_type, serde_json::to_vec(value)?))
    }

    /// Blocks frame around an already-compressed blob
    pub fn blocks(compressed: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Blocks, compressed)
    }

    /// Error frame
    pub fn error(message: impl Into<String>) -> Self {
        let msg = ErrorMessage {
            message: message.into(),
        };
        // ErrorMessage always serializes
        Self::new(
            FrameType::ServerError,
            serde_json::to_vec(&msg).unwrap_or_default(),
        )
    }

    /// Decode the JSON payload
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> TypesResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Bytes {
        let len = 1 + self.payload.len();
        let mut buf = BytesMut::with_capacity(4 + len);
        buf.put_u32(len as u32);
        buf.put_u8(self.frame_type as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode(mut data: Bytes) -> TypesResult<Self> {
        if data.len() < 5 {
            return Err(TypesError::InvalidFrame("truncated header".into()));
        }
        let len = data.get_u32() as usize;
        if len < 1 || data.len() < len {
            return Err(TypesError::InvalidFrame("truncated body".into()));
        }
        let raw_type = data.get_u8();
        let frame_type = FrameType::try_from(raw_type)
            .map_err(|_| TypesError::InvalidFrame(format!("unknown frame type {}", raw_type)))?;
        let payload = data.split_to(len - 1);
        Ok(Self {
            frame_type,
            payload,
        })
    }
}

/// Read one frame from the stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> TypesResult<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Err(TypesError::InvalidFrame("empty frame".into()));
    }
    if len > MAX_FRAME_LEN {
        return Err(TypesError::FrameTooLarge(len));
    }

    let mut buf = BytesMut::with_capacity(4 + len);
    buf.extend_from_slice(&len_buf);
    buf.resize(4 + len, 0);
    reader.read_exact(&mut buf[4..]).await?;

    Frame::decode(buf.freeze())
}

/// Write one frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> TypesResult<()> {
    if frame.payload.len() + 1 > MAX_FRAME_LEN {
        return Err(TypesError::FrameTooLarge(frame.payload.len() + 1));
    }
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
