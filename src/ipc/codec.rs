//! Frame codec shared by the dispatch surface and the worker transport.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ kind(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(kind byte) + sizeof(payload), NOT including the 4-byte prefix.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Frame kind: request.
pub const MSG_REQUEST: u8 = 0x01;
/// Frame kind: successful response.
pub const MSG_RESPONSE: u8 = 0x02;
/// Frame kind: error response.
pub const MSG_ERROR: u8 = 0xFF;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode a message as a frame of the given kind.
    pub fn encode<T: Serialize>(kind: u8, message: &T) -> io::Result<Self> {
        let payload = rmp_serde::to_vec_named(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self { kind, payload })
    }

    /// Decode the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> io::Result<T> {
        rmp_serde::from_slice(&self.payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Request envelope: `{id, service, method, body}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub body: Value,
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Response envelope: `{id, ok, body}` or `{id, ok: false, error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            body: Some(body),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: ErrorBody) -> Self {
        Self {
            id: id.into(),
            ok: false,
            body: None,
            error: Some(error),
        }
    }

    /// Encode with the frame kind matching `ok`.
    pub fn into_frame(self) -> io::Result<Frame> {
        let kind = if self.ok { MSG_RESPONSE } else { MSG_ERROR };
        Frame::encode(kind, &self)
    }
}

/// Read one frame from the stream.
///
/// Returns `None` on clean EOF. `max_frame_bytes` caps the accepted frame size.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> io::Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame too short: missing kind byte",
        ));
    }

    let mut data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut data).await?;
    let payload = data.split_off(1);

    Ok(Some(Frame {
        kind: data[0],
        payload,
    }))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let frame_len = u32::try_from(frame.payload.len() + 1)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[frame.kind]).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await
}
