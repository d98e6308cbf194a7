//! Payload Compression
//!
//! LZ4 block compression for local-tier frames. Small payloads and payloads
//! that do not shrink are stored as-is.

use bytes::Bytes;

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    /// Stored verbatim
    None,
    /// LZ4 block format with the original size prepended
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Tag byte written into codec frames
    pub fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    /// Resolve a frame tag byte
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Disable to store every payload uncompressed
    pub enabled: bool,
    /// Minimum size to compress (smaller payloads are stored uncompressed)
    pub min_size_bytes: usize,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size_bytes: 4 * 1024,
            level: 4,
        }
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Chooses whether and how to compress a payload
#[derive(Debug, Clone, Default)]
pub struct CompressionManager {
    config: CompressionConfig,
}

impl CompressionManager {
    /// Create a new compression manager with default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with custom config
    pub fn with_config(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Compress a payload if it is large enough and actually shrinks.
    ///
    /// Returns (stored_bytes, algorithm_used). Compression failures fall back
    /// to the uncompressed payload.
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if !self.config.enabled || data.len() < self.config.min_size_bytes {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.config.level)),
            true,
        ) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), CompressionAlgorithm::Lz4)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!(error = %e, size = data.len(), "LZ4 compression failed, storing uncompressed");
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Decompress a payload stored with `algorithm`
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        match algorithm {
            CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(data)),
            CompressionAlgorithm::Lz4 => lz4::block::decompress(data, None)
                .map(Bytes::from)
                .map_err(|e| Error::DecompressionFailed {
                    algorithm: algorithm.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repetitive(len: usize) -> Vec<u8> {
        b"{\"name\":\"Alice\",\"role\":\"admin\"},"
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    #[test]
    fn test_large_repetitive_payload_compresses() {
        let manager = CompressionManager::new();
        let data = repetitive(16 * 1024);

        let (stored, algorithm) = manager.compress(&data);
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);
        assert!(stored.len() < data.len());

        let restored = manager.decompress(&stored, algorithm).unwrap();
        assert_eq!(restored.as_ref(), data.as_slice());
    }

    #[test]
    fn test_small_payload_is_not_compressed() {
        let manager = CompressionManager::new();
        let (stored, algorithm) = manager.compress(b"tiny");
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored.as_ref(), b"tiny");
    }

    #[test]
    fn test_disabled_manager_stores_verbatim() {
        let manager = CompressionManager::with_config(CompressionConfig {
            enabled: false,
            ..Default::default()
        });
        let data = repetitive(8 * 1024);
        let (stored, algorithm) = manager.compress(&data);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored.len(), data.len());
    }

    #[test]
    fn test_corrupt_lz4_payload_fails() {
        let manager = CompressionManager::new();
        let result = manager.decompress(&[0xff, 0xff, 0xff, 0xff, 1, 2, 3], CompressionAlgorithm::Lz4);
        assert!(matches!(result, Err(Error::DecompressionFailed { .. })));
    }

    #[test]
    fn test_tag_roundtrip() {
        for algorithm in [CompressionAlgorithm::None, CompressionAlgorithm::Lz4] {
            assert_eq!(CompressionAlgorithm::from_tag(algorithm.tag()), Some(algorithm));
        }
        assert_eq!(CompressionAlgorithm::from_tag(9), None);
        assert_eq!(CompressionAlgorithm::Lz4.to_string(), "lz4");
    }
}
