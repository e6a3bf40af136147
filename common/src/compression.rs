//! Payload compression for durable blobs.
//!
//! Every compressed payload starts with a one byte codec tag so that a reader
//! configured with a different codec can still decode blobs written earlier,
//! and can reject bytes that were never produced by this module.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{CommonError, Result};

/// Codec applied to payloads before they reach the durable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// Store payloads as-is.
    #[default]
    None,
    /// Zstd, best ratio of the three.
    Zstd,
    /// LZ4 block format with the decompressed size prepended.
    Lz4,
    /// Snappy framed format.
    Snappy,
}

impl CompressionAlgorithm {
    fn tag(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Zstd => 1,
            CompressionAlgorithm::Lz4 => 2,
            CompressionAlgorithm::Snappy => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Zstd),
            2 => Ok(CompressionAlgorithm::Lz4),
            3 => Ok(CompressionAlgorithm::Snappy),
            other => Err(CommonError::decompression_error(format!(
                "unknown codec tag {}",
                other
            ))),
        }
    }

    /// Default level for codecs that accept one.
    pub fn default_level(&self) -> i32 {
        match self {
            CompressionAlgorithm::Zstd => 3,
            _ => 0,
        }
    }
}

/// Compression statistics information.
#[derive(Debug, Clone, Default)]
pub struct CompressionStats {
    pub total_compressions: u64,
    pub total_decompressions: u64,
    pub total_input_bytes: u64,
    pub total_compressed_bytes: u64,
}

impl CompressionStats {
    /// Compressed size over input size; zero before the first compression.
    pub fn compression_ratio(&self) -> f64 {
        if self.total_input_bytes == 0 {
            0.0
        } else {
            self.total_compressed_bytes as f64 / self.total_input_bytes as f64
        }
    }
}

/// Turns payloads into tagged frames and back.
pub trait Compressor: Debug + Send + Sync {
    /// Compress `data` into a tagged frame.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decode a tagged frame produced by any codec of this module.
    fn decompress(&self, frame: &[u8]) -> Result<Vec<u8>>;

    /// Codec used for writing.
    fn algorithm(&self) -> CompressionAlgorithm;

    fn stats(&self) -> CompressionStats;
}

/// Builder for creating compressor instances.
#[derive(Debug, Clone)]
pub struct CompressionBuilder {
    algorithm: CompressionAlgorithm,
    level: i32,
}

impl CompressionBuilder {
    pub fn with_algorithm(algorithm: CompressionAlgorithm) -> Self {
        Self {
            algorithm,
            level: algorithm.default_level(),
        }
    }

    /// Set the compression level. Only zstd honours it.
    pub fn level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn build(self) -> Result<Arc<dyn Compressor>> {
        if self.algorithm == CompressionAlgorithm::Zstd && !(1..=22).contains(&self.level) {
            return Err(CommonError::configuration_error(format!(
                "Invalid zstd compression level: {}. Must be between 1 and 22",
                self.level
            )));
        }
        Ok(Arc::new(TaggedCompressor {
            algorithm: self.algorithm,
            level: self.level,
            stats: InternalCompressionStats::default(),
        }))
    }
}

impl Default for CompressionBuilder {
    fn default() -> Self {
        Self::with_algorithm(CompressionAlgorithm::None)
    }
}

#[derive(Debug, Default)]
struct InternalCompressionStats {
    compressions: AtomicU64,
    decompressions: AtomicU64,
    input_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
}

impl InternalCompressionStats {
    fn record_compression(&self, input_size: usize, compressed_size: usize) {
        self.compressions.fetch_add(1, Ordering::AcqRel);
        self.input_bytes
            .fetch_add(input_size as u64, Ordering::AcqRel);
        self.compressed_bytes
            .fetch_add(compressed_size as u64, Ordering::AcqRel);
    }

    fn record_decompression(&self) {
        self.decompressions.fetch_add(1, Ordering::AcqRel);
    }

    fn snapshot(&self) -> CompressionStats {
        CompressionStats {
            total_compressions: self.compressions.load(Ordering::Acquire),
            total_decompressions: self.decompressions.load(Ordering::Acquire),
            total_input_bytes: self.input_bytes.load(Ordering::Acquire),
            total_compressed_bytes: self.compressed_bytes.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug)]
struct TaggedCompressor {
    algorithm: CompressionAlgorithm,
    level: i32,
    stats: InternalCompressionStats,
}

fn encode_body(algorithm: CompressionAlgorithm, level: i32, data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => zstd::encode_all(data, level)
            .map_err(|e| CommonError::compression_error_with_source("zstd encode", e)),
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Snappy => {
            let mut encoder = snap::write::FrameEncoder::new(Vec::new());
            encoder
                .write_all(data)
                .map_err(|e| CommonError::compression_error_with_source("snappy encode", e))?;
            encoder
                .into_inner()
                .map_err(|e| CommonError::compression_error(format!("snappy finish: {}", e)))
        }
    }
}

fn decode_body(algorithm: CompressionAlgorithm, body: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(body.to_vec()),
        CompressionAlgorithm::Zstd => zstd::decode_all(body)
            .map_err(|e| CommonError::decompression_error_with_source("zstd decode", e)),
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(body)
            .map_err(|e| CommonError::decompression_error_with_source("lz4 decode", e)),
        CompressionAlgorithm::Snappy => {
            let mut out = Vec::new();
            snap::read::FrameDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| CommonError::decompression_error_with_source("snappy decode", e))?;
            Ok(out)
        }
    }
}

impl Compressor for TaggedCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let body = encode_body(self.algorithm, self.level, data)?;
        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(self.algorithm.tag());
        frame.extend_from_slice(&body);
        self.stats.record_compression(data.len(), frame.len());
        Ok(frame)
    }

    fn decompress(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let (tag, body) = frame
            .split_first()
            .ok_or_else(|| CommonError::decompression_error("empty frame"))?;
        let decoded = decode_body(CompressionAlgorithm::from_tag(*tag)?, body)?;
        self.stats.record_decompression();
        Ok(decoded)
    }

    fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    fn stats(&self) -> CompressionStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DATA: &[u8] = b"partition 0 partition 0 partition 0 partition 0 partition 0 \
        partition 1 partition 1 partition 1 partition 1 partition 1 partition 1";

    #[test]
    fn test_each_codec_decodes_its_own_frames() {
        for algorithm in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Snappy,
        ] {
            let compressor = CompressionBuilder::with_algorithm(algorithm).build().unwrap();
            let frame = compressor.compress(TEST_DATA).unwrap();
            assert_eq!(compressor.decompress(&frame).unwrap(), TEST_DATA);
            assert_eq!(compressor.algorithm(), algorithm);
        }
    }

    #[test]
    fn test_reader_accepts_frames_from_other_codec() {
        let writer = CompressionBuilder::with_algorithm(CompressionAlgorithm::Zstd)
            .build()
            .unwrap();
        let reader = CompressionBuilder::with_algorithm(CompressionAlgorithm::Lz4)
            .build()
            .unwrap();

        let frame = writer.compress(TEST_DATA).unwrap();
        assert_eq!(reader.decompress(&frame).unwrap(), TEST_DATA);
    }

    #[test]
    fn test_rejects_unknown_tag_and_empty_frame() {
        let compressor = CompressionBuilder::default().build().unwrap();
        assert!(matches!(
            compressor.decompress(&[9, 1, 2]),
            Err(CommonError::DecompressionError { .. })
        ));
        assert!(compressor.decompress(&[]).is_err());
    }

    #[test]
    fn test_invalid_zstd_level() {
        let result = CompressionBuilder::with_algorithm(CompressionAlgorithm::Zstd)
            .level(40)
            .build();
        assert!(matches!(result, Err(CommonError::ConfigurationError { .. })));
    }

    #[test]
    fn test_compression_statistics() {
        let compressor = CompressionBuilder::with_algorithm(CompressionAlgorithm::Zstd)
            .build()
            .unwrap();
        let frame = compressor.compress(TEST_DATA).unwrap();
        compressor.decompress(&frame).unwrap();

        let stats = compressor.stats();
        assert_eq!(stats.total_compressions, 1);
        assert_eq!(stats.total_decompressions, 1);
        assert_eq!(stats.total_input_bytes, TEST_DATA.len() as u64);
        assert!(stats.compression_ratio() < 1.0);
    }
}
