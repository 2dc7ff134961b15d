//! # Content Hashing
//!
//! Two hash flavours back the pipeline:
//!
//! - **Identity hash**: cheap, computed up-front from the file size and
//!   the leading 1 MiB of content. It is the grouping key for a file's
//!   task set and must finish well under a second, so results are cached
//!   by `{path, size, mtime}` and reused while the file is unchanged.
//! - **Full hash**: the complete content digest computed by the
//!   background phase, streamed in 64 KiB chunks so large media files do
//!   not sit in memory.
//!
//! Both are SHA-256, rendered lowercase hex.

use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Leading bytes sampled by the identity hash.
const IDENTITY_SAMPLE_BYTES: usize = 1024 * 1024;
/// Streaming chunk size of the full hash.
const FULL_HASH_CHUNK: usize = 64 * 1024;
/// Identity cache entries; one per recently-seen path.
const IDENTITY_CACHE_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: String,
    size: u64,
    mtime: Option<SystemTime>,
}

/// Identity-hash calculator with a `{path,size,mtime}` keyed cache.
pub struct IdentityHasher {
    cache: Mutex<LruCache<CacheKey, String>>,
}

impl IdentityHasher {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(IDENTITY_CACHE_SIZE).unwrap(),
            )),
        }
    }

    /// Compute (or recall) the identity hash of a file.
    ///
    /// Returns the hash together with the file size observed while
    /// hashing, which the fast phase folds into the metadata record.
    pub async fn identity_hash(&self, path: &Path) -> std::io::Result<(String, u64)> {
        let metadata = tokio::fs::metadata(path).await?;
        let size = metadata.len();
        let key = CacheKey {
            path: path.to_string_lossy().into_owned(),
            size,
            mtime: metadata.modified().ok(),
        };

        if let Some(hash) = self.cache.lock().unwrap().get(&key) {
            return Ok((hash.clone(), size));
        }

        let mut file = File::open(path).await?;
        let mut hasher = Sha256::new();
        hasher.update(size.to_be_bytes());

        let mut remaining = IDENTITY_SAMPLE_BYTES;
        let mut buf = vec![0u8; FULL_HASH_CHUNK];
        while remaining > 0 {
            let want = remaining.min(buf.len());
            let read = file.read(&mut buf[..want]).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            remaining -= read;
        }

        let hash = format!("{:x}", hasher.finalize());
        self.cache.lock().unwrap().put(key, hash.clone());
        Ok((hash, size))
    }
}

impl Default for IdentityHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream the complete content digest of a file.
pub async fn full_hash(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; FULL_HASH_CHUNK];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
