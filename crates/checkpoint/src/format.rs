//! On-disk checkpoint layout
//!
//! ```text
//! magic[4] | version u32 | step u64 | epoch u64 | type u8 | compressed u8
//! | data_size u64 | metadata_len u32 | metadata json | data
//! ```
//! All integers are little-endian.

use bytes::Bytes;
use runtime_core::{CheckpointType, Epoch, Error, Result, Step};
use std::collections::HashMap;
use tracing::warn;

/// Magic bytes for checkpoint files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CKPT";

/// Checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Size of the fixed part of the header, before the metadata
const FIXED_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 1 + 1 + 8 + 4;

/// Checkpoint file header
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointHeader {
    pub version: u32,
    pub step: Step,
    pub epoch: Epoch,
    pub checkpoint_type: CheckpointType,
    pub compressed: bool,
    pub data_size: u64,
    pub metadata: HashMap<String, String>,
}

impl CheckpointHeader {
    /// Header for an uncompressed payload of `data_size` bytes
    pub fn new(checkpoint_type: CheckpointType, data_size: u64) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            step: 0,
            epoch: 0,
            checkpoint_type,
            compressed: false,
            data_size,
            metadata: HashMap::new(),
        }
    }

    /// Serialize the header followed by `data`
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let metadata_json = serde_json::to_string(&self.metadata)?;
        let metadata_bytes = metadata_json.as_bytes();

        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + metadata_bytes.len() + data.len());
        buf.extend_from_slice(&CHECKPOINT_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.step.to_le_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.push(self.checkpoint_type.as_u8());
        buf.push(if self.compressed { 1 } else { 0 });
        buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
        buf.extend_from_slice(&(metadata_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(metadata_bytes);
        buf.extend_from_slice(data);
        Ok(buf)
    }

    /// Parse a checkpoint file, returning its header and payload.
    ///
    /// `origin` names the source in error messages.
    pub fn decode(bytes: Bytes, origin: &str) -> Result<(Self, Bytes)> {
        let corrupted = |reason: &str| Error::CheckpointCorrupted {
            path: origin.to_string(),
            reason: reason.to_string(),
        };

        if bytes.len() < FIXED_HEADER_LEN {
            return Err(corrupted("truncated header"));
        }
        if bytes[0..4] != CHECKPOINT_MAGIC {
            return Err(corrupted("invalid magic"));
        }

        let mut cursor = Cursor { bytes: &bytes, pos: 4 };
        let version = cursor.u32();
        if version != CHECKPOINT_VERSION {
            warn!(
                path = origin,
                "Checkpoint version mismatch: expected {}, got {}", CHECKPOINT_VERSION, version
            );
        }
        let step = cursor.u64();
        let epoch = cursor.u64();
        let checkpoint_type = CheckpointType::from_u8(cursor.u8())
            .ok_or_else(|| corrupted("unknown checkpoint type"))?;
        let compressed = cursor.u8() != 0;
        let data_size = cursor.u64();
        let meta_len = cursor.u32() as usize;

        let meta_end = FIXED_HEADER_LEN + meta_len;
        let data_end = meta_end
            .checked_add(data_size as usize)
            .ok_or_else(|| corrupted("data size overflow"))?;
        if bytes.len() != data_end {
            return Err(corrupted(&format!(
                "expected {} bytes, found {}",
                data_end,
                bytes.len()
            )));
        }

        let metadata: HashMap<String, String> =
            serde_json::from_slice(&bytes[FIXED_HEADER_LEN..meta_end])?;

        let header = Self {
            version,
            step,
            epoch,
            checkpoint_type,
            compressed,
            data_size,
            metadata,
        };
        Ok((header, bytes.slice(meta_end..data_end)))
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut encoded = CheckpointHeader::new(CheckpointType::ModelOnly, 3)
            .encode(&[1, 2, 3])
            .unwrap();
        encoded[0] = b'X';

        let result = CheckpointHeader::decode(Bytes::from(encoded), "bad.ckpt");
        assert!(matches!(result, Err(Error::CheckpointCorrupted { .. })));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let encoded = CheckpointHeader::new(CheckpointType::ModelOnly, 4)
            .encode(&[9; 4])
            .unwrap();
        let truncated = Bytes::from(encoded[..encoded.len() - 1].to_vec());

        let result = CheckpointHeader::decode(truncated, "short.ckpt");
        assert!(matches!(result, Err(Error::CheckpointCorrupted { .. })));
    }

    #[test]
    fn test_decode_keeps_metadata_and_payload() {
        let mut header = CheckpointHeader::new(CheckpointType::Full, 2);
        header.step = 100;
        header.epoch = 3;
        header
            .metadata
            .insert("origin".to_string(), "rank-0".to_string());
        let encoded = header.encode(&[7, 8]).unwrap();

        let (decoded, data) = CheckpointHeader::decode(Bytes::from(encoded), "ok.ckpt").unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&data[..], &[7, 8]);
    }
}
