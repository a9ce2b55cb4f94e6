//! Opaque byte -> hex hash helpers, grounded on `torrent.rs::Hash` in the
//! teacher repo (a `Digest`-trait wrapper with a `to_hex` method), split
//! into the two algorithms this system actually needs: SHA-256 for file
//! ids and MD5 for whole-file integrity checks.

use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub async fn sha256_of_file(path: &std::path::Path) -> io::Result<String> {
    let bytes = fs::read(path).await?;
    Ok(sha256_hex(&bytes))
}

pub async fn md5_of_file(path: &std::path::Path) -> io::Result<String> {
    let bytes = fs::read(path).await?;
    Ok(md5_hex(&bytes))
}
