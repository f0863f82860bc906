//! Streaming build and verifying apply of binary deltas
//!
//! A delta is a bincode-framed op stream: `Copy` ops reference baseline
//! blocks by offset and carry the expected strong checksum, `Literal` ops
//! carry raw bytes, and a final `End` op seals the whole-file hash. Building
//! processes the new content in bounded chunks and never buffers the file;
//! applying re-hashes every copied block and the reconstructed whole, so a
//! drifted baseline surfaces as [`SyncError::DeltaCorrupt`] instead of silent
//! corruption.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checksum::{strong_checksum, RollingChecksum};
use crate::errors::{Result, SyncError};
use crate::signature::{read_full, FileSignature};

/// Chunk of new content processed at a time while building.
const CHUNK_SIZE: usize = 4 * 1024 * 1024;

const DELTA_MAGIC: [u8; 4] = *b"TSD1";

#[derive(Serialize, Deserialize)]
struct DeltaHeader {
    magic: [u8; 4],
    block_size: u32,
}

#[derive(Serialize, Deserialize)]
enum DeltaOp {
    /// Take one block from the baseline; `strong` re-verified while patching.
    Copy {
        offset: u64,
        length: u32,
        strong: [u8; 32],
    },
    Literal {
        data: Vec<u8>,
    },
    End {
        file_hash: [u8; 32],
        file_len: u64,
    },
}

/// Byte accounting of one delta build.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeltaStats {
    pub input_len: u64,
    pub literal_bytes: u64,
    pub matched_bytes: u64,
}

/// Builds deltas against a published baseline signature.
pub struct DeltaEngine {
    block_size: u32,
}

impl DeltaEngine {
    pub fn new(block_size: u32) -> Self {
        Self { block_size }
    }

    /// Stream `reader` (the new content) against `signature`, writing the
    /// delta op stream to `writer`.
    pub fn build<R: Read, W: Write>(
        &self,
        mut reader: R,
        signature: &FileSignature,
        mut writer: W,
    ) -> Result<DeltaStats> {
        bincode::serialize_into(
            &mut writer,
            &DeltaHeader {
                magic: DELTA_MAGIC,
                block_size: self.block_size,
            },
        )?;

        // Rolling checksum -> candidate block indices, like rsync's hash table.
        let mut table: HashMap<u32, Vec<usize>> = HashMap::new();
        for (i, block) in signature.blocks.iter().enumerate() {
            table.entry(block.rolling).or_default().push(i);
        }

        let mut hasher = blake3::Hasher::new();
        let mut stats = DeltaStats::default();
        let mut data: Vec<u8> = Vec::new();
        let mut eof = false;

        while !eof {
            let old = data.len();
            data.resize(old + CHUNK_SIZE, 0);
            let fresh = read_full(&mut reader, &mut data[old..])?;
            data.truncate(old + fresh);
            eof = fresh < CHUNK_SIZE;

            hasher.update(&data[old..]);
            stats.input_len += fresh as u64;

            let consumed =
                self.match_chunk(&data, &table, signature, eof, &mut writer, &mut stats)?;
            data.drain(..consumed);
        }

        bincode::serialize_into(
            &mut writer,
            &DeltaOp::End {
                file_hash: *hasher.finalize().as_bytes(),
                file_len: stats.input_len,
            },
        )?;
        writer.flush()?;

        debug!(
            input = stats.input_len,
            literal = stats.literal_bytes,
            matched = stats.matched_bytes,
            "delta built"
        );
        Ok(stats)
    }

    /// Build a delta of `new_file` into a scratch file under `scratch_dir`.
    /// The caller owns the returned path and must delete it once consumed.
    pub fn build_to_temp(
        &self,
        new_file: &Path,
        signature: &FileSignature,
        scratch_dir: &Path,
    ) -> Result<(PathBuf, DeltaStats)> {
        let reader = BufReader::new(File::open(new_file)?);
        let temp = tempfile::Builder::new()
            .prefix(".treesync-delta-")
            .tempfile_in(scratch_dir)?;
        let mut writer = BufWriter::new(temp.reopen()?);
        let stats = self.build(reader, signature, &mut writer)?;
        drop(writer);
        let path = temp.into_temp_path().keep().map_err(|e| e.error)?;
        Ok((path, stats))
    }

    /// Emit ops for one in-memory window of new content. Returns how many
    /// bytes were consumed; anything shorter than one block is carried over
    /// to the next chunk unless the input is exhausted.
    fn match_chunk<W: Write>(
        &self,
        data: &[u8],
        table: &HashMap<u32, Vec<usize>>,
        signature: &FileSignature,
        at_eof: bool,
        writer: &mut W,
        stats: &mut DeltaStats,
    ) -> Result<usize> {
        let bs = self.block_size as usize;

        if data.len() < bs || table.is_empty() {
            if at_eof {
                emit_literal(writer, data, stats)?;
                return Ok(data.len());
            }
            if table.is_empty() {
                // Nothing can ever match; pass the chunk through.
                emit_literal(writer, data, stats)?;
                return Ok(data.len());
            }
            return Ok(0);
        }

        let last_window = data.len() - bs;
        let mut rolling = RollingChecksum::new(bs);
        rolling.init(&data[..bs]);

        let mut offset = 0usize;
        let mut last_emit = 0usize;

        loop {
            if let Some(indices) = table.get(&rolling.value()) {
                let window = &data[offset..offset + bs];
                let strong = strong_checksum(window);
                let matched = indices.iter().find(|&&i| {
                    let block = &signature.blocks[i];
                    block.length as usize == bs && block.strong == strong
                });
                if let Some(&i) = matched {
                    emit_literal(writer, &data[last_emit..offset], stats)?;
                    let block = &signature.blocks[i];
                    bincode::serialize_into(
                        &mut *writer,
                        &DeltaOp::Copy {
                            offset: block.offset,
                            length: block.length,
                            strong,
                        },
                    )?;
                    stats.matched_bytes += bs as u64;

                    offset += bs;
                    last_emit = offset;
                    if offset > last_window {
                        break;
                    }
                    rolling.init(&data[offset..offset + bs]);
                    continue;
                }
            }

            if offset >= last_window {
                break;
            }
            rolling.roll(data[offset], data[offset + bs]);
            offset += 1;
        }

        if at_eof {
            emit_literal(writer, &data[last_emit..], stats)?;
            Ok(data.len())
        } else {
            // Keep one window's worth so a match can span the chunk seam.
            let cut = std::cmp::max(last_emit, data.len() + 1 - bs);
            emit_literal(writer, &data[last_emit..cut], stats)?;
            Ok(cut)
        }
    }
}

fn emit_literal<W: Write>(writer: &mut W, data: &[u8], stats: &mut DeltaStats) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    bincode::serialize_into(
        writer,
        &DeltaOp::Literal {
            data: data.to_vec(),
        },
    )?;
    stats.literal_bytes += data.len() as u64;
    Ok(())
}

/// Reconstruct new content from `baseline` plus a delta op stream, writing to
/// `out`. The baseline is only ever read; writing the result in place is the
/// replacer's job. Returns the number of bytes written.
pub fn apply_delta<R: Read, W: Write>(baseline: &Path, mut delta: R, mut out: W) -> Result<u64> {
    let header: DeltaHeader = bincode::deserialize_from(&mut delta)
        .map_err(|e| SyncError::DeltaCorrupt(format!("unreadable header: {e}")))?;
    if header.magic != DELTA_MAGIC {
        return Err(SyncError::DeltaCorrupt("bad magic".into()));
    }

    let mut baseline_file = File::open(baseline).ok().map(BufReader::new);
    let mut hasher = blake3::Hasher::new();
    let mut written = 0u64;

    loop {
        let op: DeltaOp = bincode::deserialize_from(&mut delta)
            .map_err(|e| SyncError::DeltaCorrupt(format!("truncated op stream: {e}")))?;
        match op {
            DeltaOp::Copy {
                offset,
                length,
                strong,
            } => {
                let Some(file) = baseline_file.as_mut() else {
                    return Err(SyncError::DeltaCorrupt(
                        "copy op but baseline is missing".into(),
                    ));
                };
                file.seek(SeekFrom::Start(offset))?;
                let mut block = vec![0u8; length as usize];
                file.read_exact(&mut block).map_err(|_| {
                    SyncError::DeltaCorrupt(format!("baseline too short at offset {offset}"))
                })?;
                if strong_checksum(&block) != strong {
                    return Err(SyncError::DeltaCorrupt(format!(
                        "baseline block at offset {offset} changed since signature"
                    )));
                }
                out.write_all(&block)?;
                hasher.update(&block);
                written += length as u64;
            }
            DeltaOp::Literal { data } => {
                out.write_all(&data)?;
                hasher.update(&data);
                written += data.len() as u64;
            }
            DeltaOp::End {
                file_hash,
                file_len,
            } => {
                if written != file_len {
                    return Err(SyncError::DeltaCorrupt(format!(
                        "reconstructed {written} bytes, expected {file_len}"
                    )));
                }
                if *hasher.finalize().as_bytes() != file_hash {
                    return Err(SyncError::DeltaCorrupt(
                        "reconstructed content hash mismatch".into(),
                    ));
                }
                out.flush()?;
                return Ok(written);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(baseline: &[u8], new_content: &[u8], block_size: u32) -> DeltaStats {
        let dir = tempfile::tempdir().unwrap();
        let baseline_path = dir.path().join("baseline");
        std::fs::write(&baseline_path, baseline).unwrap();

        let signature = FileSignature::index_bytes(baseline, block_size);
        let engine = DeltaEngine::new(block_size);

        let mut delta = Vec::new();
        let stats = engine
            .build(Cursor::new(new_content), &signature, &mut delta)
            .unwrap();

        let mut rebuilt = Vec::new();
        let written = apply_delta(&baseline_path, Cursor::new(&delta), &mut rebuilt).unwrap();
        assert_eq!(written, new_content.len() as u64);
        assert_eq!(rebuilt, new_content);
        stats
    }

    #[test]
    fn round_trip_empty_file() {
        round_trip(b"some baseline", b"", 4);
    }

    #[test]
    fn round_trip_smaller_than_block() {
        let stats = round_trip(b"some baseline content", b"xy", 8);
        assert_eq!(stats.literal_bytes, 2);
    }

    #[test]
    fn round_trip_identical_content_is_all_matches() {
        let content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let stats = round_trip(&content, &content, 256);
        assert_eq!(stats.matched_bytes, 4096);
        assert_eq!(stats.literal_bytes, 0);
    }

    #[test]
    fn round_trip_with_edit_in_the_middle() {
        let baseline: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
        let mut new_content = baseline.clone();
        new_content.splice(5000..5000, b"inserted run of bytes".iter().copied());

        let stats = round_trip(&baseline, &new_content, 512);
        assert!(stats.matched_bytes > 0, "unchanged regions should match");
        assert!(stats.literal_bytes < new_content.len() as u64);
    }

    #[test]
    fn round_trip_against_empty_baseline() {
        round_trip(b"", b"entirely new content", 4);
    }

    #[test]
    fn missing_baseline_is_fine_for_literal_only_delta() {
        let dir = tempfile::tempdir().unwrap();
        let signature = FileSignature::index_bytes(b"", 4);
        let engine = DeltaEngine::new(4);

        let mut delta = Vec::new();
        engine
            .build(Cursor::new(b"abc".as_slice()), &signature, &mut delta)
            .unwrap();

        let mut rebuilt = Vec::new();
        let never_existed = dir.path().join("never-published");
        apply_delta(&never_existed, Cursor::new(&delta), &mut rebuilt).unwrap();
        assert_eq!(rebuilt, b"abc");
    }

    #[test]
    fn drifted_baseline_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let baseline: Vec<u8> = (0..2048u32).map(|i| (i % 199) as u8).collect();
        let baseline_path = dir.path().join("baseline");
        std::fs::write(&baseline_path, &baseline).unwrap();

        let signature = FileSignature::index_bytes(&baseline, 256);
        let engine = DeltaEngine::new(256);
        let mut delta = Vec::new();
        engine
            .build(Cursor::new(&baseline), &signature, &mut delta)
            .unwrap();

        // The baseline changes after the signature was published.
        let mut drifted = baseline.clone();
        drifted[100] ^= 0xFF;
        std::fs::write(&baseline_path, &drifted).unwrap();

        let mut rebuilt = Vec::new();
        let err = apply_delta(&baseline_path, Cursor::new(&delta), &mut rebuilt).unwrap_err();
        assert!(matches!(err, SyncError::DeltaCorrupt(_)), "got {err:?}");
    }

    #[test]
    fn truncated_delta_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let baseline_path = dir.path().join("baseline");
        std::fs::write(&baseline_path, b"baseline").unwrap();

        let signature = FileSignature::index_bytes(b"baseline", 4);
        let engine = DeltaEngine::new(4);
        let mut delta = Vec::new();
        engine
            .build(
                Cursor::new(b"some new content".as_slice()),
                &signature,
                &mut delta,
            )
            .unwrap();
        delta.truncate(delta.len() - 10);

        let mut rebuilt = Vec::new();
        let err = apply_delta(&baseline_path, Cursor::new(&delta), &mut rebuilt).unwrap_err();
        assert!(matches!(err, SyncError::DeltaCorrupt(_)));
    }

    #[test]
    fn build_to_temp_leaves_a_consumable_file() {
        let dir = tempfile::tempdir().unwrap();
        let new_file = dir.path().join("new");
        std::fs::write(&new_file, b"fresh bytes").unwrap();

        let engine = DeltaEngine::new(4);
        let signature = FileSignature::index_bytes(b"old bytes", 4);
        let (path, stats) = engine
            .build_to_temp(&new_file, &signature, dir.path())
            .unwrap();
        assert!(path.exists());
        assert_eq!(stats.input_len, 11);
        std::fs::remove_file(path).unwrap();
    }
}
