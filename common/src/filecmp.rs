use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use tracing::instrument;

const CHUNK_SIZE: usize = 64 * 1024;

/// SHA-256 of a file's content, read in fixed-size chunks. Blocking.
#[instrument]
pub fn sha256_file(path: &std::path::Path) -> Result<[u8; 32]> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("cannot open {:?} for reading", path))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("failed reading {:?}", path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().into())
}

/// Compares the content of two files by digest, hashing both sides concurrently.
#[instrument]
pub async fn content_differs(src: &std::path::Path, dst: &std::path::Path) -> Result<bool> {
    let (src, dst) = (src.to_owned(), dst.to_owned());
    let (src_digest, dst_digest) = tokio::try_join!(
        tokio::task::spawn_blocking(move || sha256_file(&src)),
        tokio::task::spawn_blocking(move || sha256_file(&dst)),
    )?;
    Ok(src_digest? != dst_digest?)
}
