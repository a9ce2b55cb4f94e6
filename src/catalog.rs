//! Block-file access: directory scan, bounds-checked block reads, and
//! the deterministic save/verify path used once a download completes.
//!
//! Grounded on `tracker.rs::DownloadingFile` (seek-to-offset + write_all
//! on a `tokio::fs::File`), generalized from "write one torrent piece at
//! its offset" to "read/write one block at its offset".

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::hashing;

/// A single catalog entry, immutable once the server has scanned it.
#[derive(Debug, Clone)]
pub struct ServerFile {
    pub name: String,
    pub id: String,
    pub md5: String,
    pub path: PathBuf,
    pub len: u64,
}

/// Scans `dir` for regular files and hashes each once.
///
/// Matches spec.md's `ServerFile` lifecycle: created at server startup,
/// immutable thereafter. The id is the hex SHA-256 of the file's bytes.
pub async fn list_files(dir: &Path) -> Result<Vec<ServerFile>> {
    let mut out = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading files directory {}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        let id = hashing::sha256_of_file(&path).await?;
        let md5 = hashing::md5_of_file(&path).await?;
        debug!("catalogued {name} as {id}");

        out.push(ServerFile {
            name,
            id,
            md5,
            path,
            len: metadata.len(),
        });
    }

    Ok(out)
}

/// Number of blocks of size `block_size` needed to cover `file_len` bytes.
pub fn block_count(file_len: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        return 0;
    }
    file_len.div_ceil(block_size)
}

/// Reads the `index`-th `block_size`-sized slice of the file at `path`.
///
/// Returns an empty vec for any index at or beyond `block_count`, per
/// spec.md's "block-index out of range returns an empty frame" rule.
pub async fn get_block(path: &Path, index: u64, block_size: u64) -> Result<Vec<u8>> {
    let metadata = fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    let file_len = metadata.len();

    if block_size == 0 || index >= block_count(file_len, block_size) {
        return Ok(Vec::new());
    }

    let start = index * block_size;
    let end = std::cmp::min(start + block_size, file_len);
    let len = (end - start) as usize;

    let mut file = fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Deterministic save location so the trusted-peer server can find a
/// verified download again: `output_<fileId>.bin` under `dir`.
pub fn saved_path(dir: &Path, file_id: &str) -> PathBuf {
    dir.join(format!("output_{file_id}.bin"))
}

pub async fn save_file(bytes: &[u8], file_id: &str, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    let path = saved_path(dir, file_id);
    let mut file = fs::File::create(&path).await?;
    file.write_all(bytes).await?;
    Ok(path)
}

pub async fn md5_of_saved(path: &Path) -> Result<String> {
    Ok(hashing::md5_of_file(path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_count_rounds_up() {
        assert_eq!(block_count(250, 100), 3);
        assert_eq!(block_count(300, 100), 3);
        assert_eq!(block_count(0, 100), 0);
    }

    #[tokio::test]
    async fn get_block_returns_short_tail_and_then_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let data = vec![7u8; 250];
        fs::write(&path, &data).await.unwrap();

        let b0 = get_block(&path, 0, 100).await.unwrap();
        let b1 = get_block(&path, 1, 100).await.unwrap();
        let b2 = get_block(&path, 2, 100).await.unwrap();
        let b3 = get_block(&path, 3, 100).await.unwrap();

        assert_eq!(b0.len(), 100);
        assert_eq!(b1.len(), 100);
        assert_eq!(b2.len(), 50);
        assert_eq!(b3.len(), 0);
    }

    #[tokio::test]
    async fn list_files_hashes_every_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").await.unwrap();
        fs::write(dir.path().join("b.txt"), b"world").await.unwrap();

        let files = list_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 2);
        for f in &files {
            assert_eq!(f.id.len(), 64);
            assert_eq!(f.md5.len(), 32);
        }
    }

    #[tokio::test]
    async fn save_then_reread_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"round trip me".to_vec();
        let path = save_file(&data, "deadbeef", dir.path()).await.unwrap();
        let reread = fs::read(&path).await.unwrap();
        assert_eq!(reread, data);
        assert_eq!(md5_of_saved(&path).await.unwrap(), hashing::md5_hex(&data));
    }
}
