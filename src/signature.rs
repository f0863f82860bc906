//! Content-addressed block signatures of baseline files
//!
//! A peer publishes a [`FileSignature`] when it publishes a file; other peers
//! later build deltas against it. Signatures are cached in a
//! [`SignatureStore`] keyed by the identifier carried in the action target
//! descriptor.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::checksum::{rolling_checksum, strong_checksum};
use crate::errors::{Result, SyncError};
use crate::action::SignatureId;

/// Checksums of one baseline block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChecksum {
    pub offset: u64,
    pub rolling: u32,
    pub strong: [u8; 32],
    pub length: u32,
}

/// Rolling-checksum index of one baseline file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSignature {
    pub block_size: u32,
    pub total_len: u64,
    pub blocks: Vec<BlockChecksum>,
}

impl FileSignature {
    /// Index a baseline by streaming it block by block; never buffers the
    /// whole file.
    pub fn index_reader<R: Read>(mut reader: R, block_size: u32) -> Result<Self> {
        let mut blocks = Vec::new();
        let mut buffer = vec![0u8; block_size as usize];
        let mut offset = 0u64;

        loop {
            let filled = read_full(&mut reader, &mut buffer)?;
            if filled == 0 {
                break;
            }
            let block = &buffer[..filled];
            blocks.push(BlockChecksum {
                offset,
                rolling: rolling_checksum(block),
                strong: strong_checksum(block),
                length: filled as u32,
            });
            offset += filled as u64;
            if filled < buffer.len() {
                break;
            }
        }

        Ok(Self {
            block_size,
            total_len: offset,
            blocks,
        })
    }

    pub fn index_file(path: &Path, block_size: u32) -> Result<Self> {
        let file = File::open(path)?;
        Self::index_reader(BufReader::new(file), block_size)
    }

    pub fn index_bytes(data: &[u8], block_size: u32) -> Self {
        // Reading from a slice cannot fail.
        Self::index_reader(data, block_size).unwrap_or(Self {
            block_size,
            total_len: 0,
            blocks: Vec::new(),
        })
    }
}

/// Fill `buf` as far as the reader allows; a short count means end of input.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// In-memory cache of published signatures.
#[derive(Default)]
pub struct SignatureStore {
    inner: RwLock<HashMap<SignatureId, Arc<FileSignature>>>,
}

impl SignatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, id: SignatureId, signature: FileSignature) {
        self.inner.write().insert(id, Arc::new(signature));
    }

    /// Resolve a signature id; [`SyncError::SignatureUnavailable`] tells the
    /// caller to fall back to full transfer for that target.
    pub fn lookup(&self, id: &SignatureId) -> Result<Arc<FileSignature>> {
        self.inner
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::SignatureUnavailable(id.clone()))
    }

    pub fn forget(&self, id: &SignatureId) {
        self.inner.write().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_partial_trailing_block() {
        let sig = FileSignature::index_bytes(b"0123456789", 4);
        assert_eq!(sig.total_len, 10);
        assert_eq!(sig.blocks.len(), 3);
        assert_eq!(sig.blocks[0].length, 4);
        assert_eq!(sig.blocks[2].offset, 8);
        assert_eq!(sig.blocks[2].length, 2);
    }

    #[test]
    fn empty_input_has_no_blocks() {
        let sig = FileSignature::index_bytes(b"", 4);
        assert_eq!(sig.total_len, 0);
        assert!(sig.blocks.is_empty());
    }

    #[test]
    fn store_lookup_miss_is_signature_unavailable() {
        let store = SignatureStore::new();
        let err = store.lookup(&SignatureId::from("nope")).unwrap_err();
        assert!(matches!(err, SyncError::SignatureUnavailable(_)));

        store.publish(
            SignatureId::from("yes"),
            FileSignature::index_bytes(b"abc", 4),
        );
        assert!(store.lookup(&SignatureId::from("yes")).is_ok());
    }
}
