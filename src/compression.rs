//! Compression of partition sub-blocks.

use std::io;

/// Default zstd level for partition payloads.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 1;

/// Compression applied to a serialized partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompressionMode {
    /// Store the sub-block verbatim.
    None,
    /// zstd with the given level.
    Zstd { level: i32 },
}

impl Default for CompressionMode {
    fn default() -> Self {
        CompressionMode::Zstd {
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl CompressionMode {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            CompressionMode::None => 0,
            CompressionMode::Zstd { .. } => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8, level: i32) -> io::Result<Self> {
        match tag {
            0 => Ok(CompressionMode::None),
            1 => Ok(CompressionMode::Zstd { level }),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown compression tag",
            )),
        }
    }

    /// Compresses `data` into a new buffer.
    pub fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            CompressionMode::None => Ok(data.to_vec()),
            CompressionMode::Zstd { level } => zstd::bulk::compress(data, *level),
        }
    }

    /// Decompresses `data`, which must expand to exactly
    /// `uncompressed_len` bytes.
    pub fn decompress(&self, data: &[u8], uncompressed_len: usize) -> io::Result<Vec<u8>> {
        let out = match self {
            CompressionMode::None => data.to_vec(),
            CompressionMode::Zstd { .. } => zstd::bulk::decompress(data, uncompressed_len)?,
        };
        if out.len() != uncompressed_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "sub-block length mismatch after decompression",
            ));
        }
        Ok(out)
    }
}
