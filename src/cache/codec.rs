//! Serialization Codec
//!
//! Converts typed values to and from the two wire forms the tiers use:
//!
//! - **String form** (shared tier): the value as JSON text.
//! - **Frame form** (local tier): a length-prefixed binary frame
//!
//! ```text
//! ┌──────────────────┬───────────────┬──────────────────────────┐
//! │ payload len (u32 │ compression   │ payload (JSON, possibly  │
//! │ big-endian)      │ tag (u8)      │ LZ4-compressed)          │
//! └──────────────────┴───────────────┴──────────────────────────┘
//! ```
//!
//! The codec is stateless apart from its compression settings.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::compression::{CompressionAlgorithm, CompressionConfig, CompressionManager};
use crate::error::{Error, Result};

/// Bytes preceding the payload in a frame
pub const FRAME_HEADER_LEN: usize = 5;

/// Stateless value codec
#[derive(Debug, Clone, Default)]
pub struct Codec {
    compression: CompressionManager,
}

impl Codec {
    /// Create a codec with default compression settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with custom compression settings
    pub fn with_compression(config: CompressionConfig) -> Self {
        Self {
            compression: CompressionManager::with_config(config),
        }
    }

    /// Encode a value into its shared-tier string form
    pub fn encode_string<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    /// Decode a value from its shared-tier string form
    pub fn decode_string<T: DeserializeOwned>(&self, payload: &str) -> Result<T> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Encode a value straight into a local-tier frame
    pub fn encode_frame<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        let json = serde_json::to_vec(value)?;
        self.frame(&json)
    }

    /// Decode a value from a local-tier frame
    pub fn decode_frame<T: DeserializeOwned>(&self, frame: &[u8]) -> Result<T> {
        let json = self.unframe(frame)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Wrap an already-encoded string form into a frame (used for backfill)
    pub fn frame_from_string(&self, payload: &str) -> Result<Bytes> {
        self.frame(payload.as_bytes())
    }

    /// Recover the string form from a frame
    pub fn string_from_frame(&self, frame: &[u8]) -> Result<String> {
        let json = self.unframe(frame)?;
        String::from_utf8(json.to_vec()).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn frame(&self, json: &[u8]) -> Result<Bytes> {
        let (payload, algorithm) = self.compression.compress(json);
        let len = u32::try_from(payload.len()).map_err(|_| {
            Error::Serialization(format!("payload of {} bytes exceeds frame limit", payload.len()))
        })?;

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u32(len);
        buf.put_u8(algorithm.tag());
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    fn unframe(&self, frame: &[u8]) -> Result<Bytes> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(Error::Serialization(format!(
                "frame of {} bytes is shorter than its header",
                frame.len()
            )));
        }

        let mut header = &frame[..FRAME_HEADER_LEN];
        let len = header.get_u32() as usize;
        let tag = header.get_u8();

        let payload = &frame[FRAME_HEADER_LEN..];
        if payload.len() != len {
            return Err(Error::Serialization(format!(
                "frame declares {} payload bytes but carries {}",
                len,
                payload.len()
            )));
        }

        let algorithm = CompressionAlgorithm::from_tag(tag)
            .ok_or_else(|| Error::Serialization(format!("unknown compression tag {}", tag)))?;

        self.compression.decompress(payload, algorithm)
    }
}

// =============================================================================
// Tests
// =============================================================================
