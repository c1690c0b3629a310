use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Package compression level
///
/// `Standard` uses zstd level 3 (fast, good ratio). `Maximum` uses zstd
/// level 19; slower, but bounded — on package-sized payloads it stays
/// within a small multiple of `Standard`'s build time, which keeps it
/// usable from a polling UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    None,
    Standard,
    Maximum,
}

impl FromStr for CompressionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "standard" => Ok(Self::Standard),
            "maximum" => Ok(Self::Maximum),
            _ => Err(format!("Unknown compression level: {}", s)),
        }
    }
}

impl CompressionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Standard => "standard",
            Self::Maximum => "maximum",
        }
    }

    fn zstd_level(&self) -> Option<i32> {
        match self {
            Self::None => None,
            Self::Standard => Some(3),
            Self::Maximum => Some(19),
        }
    }
}

/// Compress a payload at the given level. `None` stores the bytes as-is.
pub fn compress(data: &[u8], level: CompressionLevel) -> io::Result<Vec<u8>> {
    match level.zstd_level() {
        None => Ok(data.to_vec()),
        Some(zstd_level) => {
            let mut encoder = zstd::Encoder::new(Vec::new(), zstd_level)?;
            encoder.write_all(data)?;
            encoder.finish()
        }
    }
}

/// Decompress a payload produced by [`compress`].
pub fn decompress(data: &[u8], level: CompressionLevel) -> io::Result<Vec<u8>> {
    match level.zstd_level() {
        None => Ok(data.to_vec()),
        Some(_) => {
            let mut decoder = zstd::Decoder::new(data)?;
            let mut result = Vec::new();
            decoder.read_to_end(&mut result)?;
            Ok(result)
        }
    }
}
