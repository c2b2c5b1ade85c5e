//! Model artifact encoding.
//!
//! Layout (little endian):
//!
//! ```text
//! ┌────────┬─────────┬───────────┬──────────┬──────────────────┐
//! │ "FLWR" │ fmt u16 │ len u64   │ crc32 u32│ bincode payload  │
//! └────────┴─────────┴───────────┴──────────┴──────────────────┘
//! ```
//!
//! The length and checksum let a reader tell a finished upload from one it
//! raced with, instead of deserializing a prefix of the weights.

use super::classifier::FlowerClassifier;
use crate::error::{FlowerError, Result};
use bytes::{BufMut, Bytes, BytesMut};

const MAGIC: &[u8; 4] = b"FLWR";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 8 + 4;

/// Serialize a classifier into an artifact.
pub fn encode(model: &FlowerClassifier) -> Result<Bytes> {
    let payload = bincode::serialize(model)?;
    let checksum = crc32fast::hash(&payload);

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u16_le(FORMAT_VERSION);
    buf.put_u64_le(payload.len() as u64);
    buf.put_u32_le(checksum);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Deserialize and validate an artifact.
pub fn decode(data: &[u8]) -> Result<FlowerClassifier> {
    if data.len() < HEADER_LEN {
        return Err(FlowerError::IncompleteArtifact(format!(
            "{} bytes is shorter than the header",
            data.len()
        )));
    }
    if &data[0..4] != MAGIC {
        return Err(FlowerError::UnsupportedArtifact("bad magic".to_string()));
    }

    let format = u16::from_le_bytes([data[4], data[5]]);
    if format != FORMAT_VERSION {
        return Err(FlowerError::UnsupportedArtifact(format!(
            "format version {}",
            format
        )));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[6..14]);
    let declared = u64::from_le_bytes(len_bytes);
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&data[14..18]);
    let expected = u32::from_le_bytes(crc_bytes);

    let payload = &data[HEADER_LEN..];
    if payload.len() as u64 != declared {
        return Err(FlowerError::IncompleteArtifact(format!(
            "payload is {} bytes, header declares {}",
            payload.len(),
            declared
        )));
    }

    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(FlowerError::ChecksumMismatch { expected, actual });
    }

    let model: FlowerClassifier = bincode::deserialize(payload)?;
    model.validate()?;
    Ok(model)
}
