//! Optional zstd compression for payloads written to the disk tier.

use thiserror::Error;

use crate::config::CompressionConfig;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Decompressed {actual} bytes, expected {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
}

/// Encodes payloads for disk and decodes them on the way back.
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Encode a payload for storage. Returns the stored bytes and whether
    /// they are compressed. Compression is skipped when it does not help.
    pub fn encode(&self, data: &[u8]) -> Result<(Vec<u8>, bool), CompressionError> {
        if !self.config.disk_zstd_compression {
            return Ok((data.to_vec(), false));
        }
        let compressed = self.zstd_compress(data)?;
        if compressed.len() < data.len() {
            Ok((compressed, true))
        } else {
            Ok((data.to_vec(), false))
        }
    }

    /// Reverse [`Self::encode`].
    pub fn decode(
        &self,
        stored: Vec<u8>,
        compressed: bool,
        raw_len: u64,
    ) -> Result<Vec<u8>, CompressionError> {
        let data = if compressed {
            self.zstd_decompress(&stored)?
        } else {
            stored
        };
        if data.len() as u64 != raw_len {
            return Err(CompressionError::LengthMismatch {
                expected: raw_len,
                actual: data.len() as u64,
            });
        }
        Ok(data)
    }

    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let compressed = zstd::encode_all(data, self.config.zstd_level)?;
        Ok(compressed)
    }

    fn zstd_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let decompressed = zstd::decode_all(data)?;
        Ok(decompressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> CompressionConfig {
        CompressionConfig {
            disk_zstd_compression: true,
            zstd_level: 3,
        }
    }

    #[test]
    fn test_zstd_roundtrip() {
        let compressor = Compressor::new(enabled());
        let data = vec![42u8; 4096];

        let (stored, compressed) = compressor.encode(&data).unwrap();
        assert!(compressed);
        assert!(stored.len() < data.len()); // should compress well

        let decoded = compressor.decode(stored, true, data.len() as u64).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_disabled_stores_raw() {
        let compressor = Compressor::new(CompressionConfig::default());
        let (stored, compressed) = compressor.encode(b"hello").unwrap();
        assert!(!compressed);
        assert_eq!(stored, b"hello");
    }

    #[test]
    fn test_incompressible_stored_raw() {
        let compressor = Compressor::new(enabled());
        let (_, compressed) = compressor.encode(&[1, 2, 3]).unwrap();
        assert!(!compressed);
    }

    #[test]
    fn test_length_mismatch_detected() {
        let compressor = Compressor::new(CompressionConfig::default());
        assert!(compressor.decode(vec![1, 2], false, 3).is_err());
    }
}
