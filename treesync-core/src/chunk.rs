//! Fixed-size chunking of local files.
//!
//! A file of `size` bytes is split into `ceil(size / chunk_size)` chunks;
//! every chunk is exactly `chunk_size` bytes except possibly the last.
//! [`ChunkStore`] carries no state beyond the chunk size.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::{io_err, CoreError};
use crate::types::{ChunkFingerprint, LocalState};

/// Default chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Number of chunks for a file of `size` bytes.
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size)
}

/// Length of chunk `index` in a file of `size` bytes (0 past the end).
pub fn chunk_len(size: u64, chunk_size: u64, index: u64) -> u64 {
    let start = index.saturating_mul(chunk_size);
    size.saturating_sub(start).min(chunk_size)
}

/// Splits files into fixed-size chunks and fingerprints them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStore {
    chunk_size: u64,
}

impl ChunkStore {
    /// `chunk_size` must be non-zero; [`crate::SyncConfig::validate`] enforces it.
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Fingerprints of in-memory `data`.
    pub fn fingerprints(&self, data: &[u8]) -> Vec<ChunkFingerprint> {
        data.chunks(self.chunk_size as usize)
            .map(ChunkFingerprint::of)
            .collect()
    }

    /// Stat and fingerprint the file at `path`, one chunk at a time.
    ///
    /// Fails with [`CoreError::ChangedDuringRead`] if the file's length moves
    /// while it is being read.
    pub fn scan_file(&self, path: &Path) -> Result<LocalState, CoreError> {
        let mut file = File::open(path).map_err(|e| io_err(path, e))?;
        let meta = file.metadata().map_err(|e| io_err(path, e))?;
        let size = meta.len();
        let mtime: DateTime<Utc> = meta.modified().map_err(|e| io_err(path, e))?.into();

        let mut buf = vec![0u8; self.chunk_size.min(size.max(1)) as usize];
        let mut chunks = Vec::with_capacity(chunk_count(size, self.chunk_size) as usize);
        let mut total = 0u64;
        loop {
            let read = read_full(&mut file, &mut buf).map_err(|e| io_err(path, e))?;
            if read == 0 {
                break;
            }
            total += read as u64;
            chunks.push(ChunkFingerprint::of(&buf[..read]));
            if read < buf.len() {
                break;
            }
        }

        let after = std::fs::metadata(path).map_err(|e| io_err(path, e))?;
        if total != size || after.len() != size {
            return Err(CoreError::ChangedDuringRead {
                path: path.to_path_buf(),
            });
        }

        Ok(LocalState {
            size,
            mtime,
            chunk_size: self.chunk_size,
            chunks,
        })
    }

    /// Read chunk `index` of the file at `path`.
    ///
    /// Returns fewer than `chunk_size` bytes for the final chunk, and an empty
    /// vector past the end of the file.
    pub fn read_chunk(&self, path: &Path, index: u64) -> Result<Vec<u8>, CoreError> {
        let mut file = File::open(path).map_err(|e| io_err(path, e))?;
        file.seek(SeekFrom::Start(index * self.chunk_size))
            .map_err(|e| io_err(path, e))?;
        let mut buf = vec![0u8; self.chunk_size as usize];
        let read = read_full(&mut file, &mut buf).map_err(|e| io_err(path, e))?;
        buf.truncate(read);
        Ok(buf)
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs;
    use tempfile::TempDir;

    #[rstest]
    #[case(0, 4, 0)]
    #[case(1, 4, 1)]
    #[case(4, 4, 1)]
    #[case(5, 4, 2)]
    #[case(10 * 1024, 4096, 3)]
    fn chunk_count_is_ceiling(#[case] size: u64, #[case] chunk: u64, #[case] expected: u64) {
        assert_eq!(chunk_count(size, chunk), expected);
    }

    #[test]
    fn chunk_len_handles_tail_and_past_end() {
        assert_eq!(chunk_len(10, 4, 0), 4);
        assert_eq!(chunk_len(10, 4, 2), 2);
        assert_eq!(chunk_len(10, 4, 3), 0);
    }

    #[test]
    fn scan_file_matches_in_memory_fingerprints() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        let store = ChunkStore::new(4096);
        let state = store.scan_file(&path).unwrap();
        assert_eq!(state.size, 10_000);
        assert_eq!(state.chunks, store.fingerprints(&data));
        assert_eq!(state.chunks.len(), 3);
    }

    #[test]
    fn scan_empty_file_has_no_chunks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty");
        fs::write(&path, b"").unwrap();
        let state = ChunkStore::new(16).scan_file(&path).unwrap();
        assert_eq!(state.size, 0);
        assert!(state.chunks.is_empty());
    }

    #[test]
    fn scan_missing_file_is_vanished() {
        let tmp = TempDir::new().unwrap();
        let err = ChunkStore::new(16)
            .scan_file(&tmp.path().join("nope"))
            .unwrap_err();
        assert!(err.is_vanished());
    }

    #[test]
    fn read_chunk_returns_tail_and_empty_past_end() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        fs::write(&path, b"0123456789").unwrap();
        let store = ChunkStore::new(4);
        assert_eq!(store.read_chunk(&path, 1).unwrap(), b"4567");
        assert_eq!(store.read_chunk(&path, 2).unwrap(), b"89");
        assert!(store.read_chunk(&path, 5).unwrap().is_empty());
    }
}
