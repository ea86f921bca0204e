//! GGUF artifact inspection.
//!
//! Reads the fixed-size GGUF header to confirm a file is a loadable model
//! before a handle is constructed from it.

use std::io::Read;
use std::path::Path;

use bytes::Buf;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// `GGUF` in little-endian byte order.
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// magic (4) + version (4) + tensor_count (8) + kv_count (8).
const HEADER_LEN: usize = 24;

#[derive(Error, Debug)]
pub enum ModelLoaderError {
    #[error("Model file not found at path: {0}")]
    FileNotFound(String),

    #[error("Invalid GGUF format: {0}")]
    InvalidFormat(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Metadata extracted from a GGUF model file header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelMetadata {
    /// GGUF format version.
    pub version: u32,

    /// Number of tensors in the file.
    pub tensor_count: u64,

    /// Number of metadata key/value pairs.
    pub kv_count: u64,

    /// File size in bytes.
    pub file_size: u64,

    /// Quantization type string, inferred from the file name.
    pub quantization: String,
}

/// Load model metadata from a GGUF file.
pub fn load_metadata(path: &Path) -> Result<ModelMetadata, ModelLoaderError> {
    if !path.exists() {
        return Err(ModelLoaderError::FileNotFound(path.display().to_string()));
    }

    let file_size = std::fs::metadata(path)?.len();

    let mut header = [0u8; HEADER_LEN];
    let mut file = std::fs::File::open(path)?;
    file.read_exact(&mut header).map_err(|_| {
        ModelLoaderError::InvalidFormat(format!(
            "{} is shorter than a GGUF header ({file_size} bytes)",
            path.display()
        ))
    })?;

    let mut buf = &header[..];
    let magic = buf.get_u32_le();
    if magic != GGUF_MAGIC {
        return Err(ModelLoaderError::InvalidFormat(format!(
            "bad magic {magic:#010x} in {}",
            path.display()
        )));
    }
    let version = buf.get_u32_le();
    if !(1..=3).contains(&version) {
        return Err(ModelLoaderError::InvalidFormat(format!(
            "unsupported GGUF version {version}"
        )));
    }
    let tensor_count = buf.get_u64_le();
    let kv_count = buf.get_u64_le();

    let metadata = ModelMetadata {
        version,
        tensor_count,
        kv_count,
        file_size,
        quantization: quantization_from_filename(path),
    };

    info!(
        path = %path.display(),
        version = metadata.version,
        tensors = metadata.tensor_count,
        kv = metadata.kv_count,
        quant = metadata.quantization,
        "Loaded model metadata"
    );

    Ok(metadata)
}

fn quantization_from_filename(path: &Path) -> String {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_uppercase();

    ["Q4_K_M", "Q8_0", "FP16"]
        .iter()
        .find(|tag| filename.contains(**tag))
        .map(|tag| tag.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Write a minimal, header-only GGUF file.
#[cfg(test)]
pub(crate) fn write_test_gguf(path: &Path) {
    use bytes::BufMut;

    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.put_u32_le(GGUF_MAGIC);
    buf.put_u32_le(3);
    buf.put_u64_le(0);
    buf.put_u64_le(0);
    std::fs::write(path, buf).unwrap();
}
