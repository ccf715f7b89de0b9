//! Length-prefixed JSON framing.
//!
//! Wire layout of every frame:
//!
//! ```text
//! +----------------------+-------------------------------+
//! | length: u32 (native) | body: `length` bytes of JSON  |
//! +----------------------+-------------------------------+
//! ```
//!
//! The prefix is written in host byte order, so both peers must share
//! endianness. Request bodies are `{"in": <name>, "params": <any>}` and
//! response bodies are `{"out": <name>, "result": <any>}`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RpcError};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// A request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "in")]
    pub operation: String,
    pub params: Value,
}

impl Request {
    pub fn new(operation: impl Into<String>, params: Value) -> Self {
        Self {
            operation: operation.into(),
            params,
        }
    }
}

/// A response message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "out")]
    pub operation: String,
    pub result: Value,
}

impl Response {
    pub fn new(operation: impl Into<String>, result: Value) -> Self {
        Self {
            operation: operation.into(),
            result,
        }
    }
}

/// One complete frame as cut from the byte stream.
///
/// `length` always equals `body.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub length: u32,
    pub body: Bytes,
}

impl Frame {
    /// Decode the body into a message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode_body(&self.body)
    }
}

/// Read the length prefix from the first four bytes of `header`.
#[inline]
pub fn read_length(header: &[u8; HEADER_LEN]) -> u32 {
    u32::from_ne_bytes(*header)
}

/// Serialize `message` and prepend its length.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut out = BytesMut::new();
    encode_into(message, &mut out)?;
    Ok(out.to_vec())
}

/// Serialize `message` as a frame appended to `out`.
///
/// On error nothing is appended.
pub fn encode_into<T: Serialize>(message: &T, out: &mut BytesMut) -> Result<()> {
    let body = serde_json::to_vec(message).map_err(RpcError::Encode)?;
    let length = u32::try_from(body.len()).map_err(|_| RpcError::FrameTooLarge {
        length: body.len() as u64,
        max: u32::MAX,
    })?;

    out.reserve(HEADER_LEN + body.len());
    out.put_slice(&length.to_ne_bytes());
    out.put_slice(&body);
    Ok(())
}

/// Decode exactly one complete frame (prefix included).
pub fn decode<T: DeserializeOwned>(frame_bytes: &[u8]) -> Result<T> {
    let Some((header, body)) = frame_bytes.split_first_chunk::<HEADER_LEN>() else {
        return Err(RpcError::Truncated {
            buffered: frame_bytes.len(),
        });
    };

    let declared = read_length(header);
    if body.len() != declared as usize {
        return Err(RpcError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }

    decode_body(body)
}

/// Decode a frame body. Invalid UTF-8, invalid JSON and missing keys are
/// all reported as [`RpcError::Malformed`].
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(RpcError::Malformed)
}
