//! Opaque session persistence.
//!
//! The core stores agent sessions as opaque blobs keyed by the rendered
//! [`AgentIdentifier`](crate::morgana::session::AgentIdentifier) key. The
//! [`SessionStore`] contract guarantees idempotent saves and last-write-wins
//! semantics for concurrent saves of the same key; encryption, encoding, and
//! the backing store belong to the implementation, not the core.
//!
//! Two reference implementations ship with the crate:
//!
//! - [`InMemorySessionStore`] — process-local map; the default, and what the
//!   test suites use.
//! - [`FileSessionStore`] — one file per key under a configured directory.
//!   File names are the hex SHA-256 of the key, so arbitrary conversation ids
//!   cannot escape the directory or collide with path syntax.
//!
//! Persistence failures are surfaced as errors to the caller and logged; they
//! never crash a conversation (the agent runtime treats saving as
//! best-effort).

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Blob storage for agent sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist `blob` under `key`, replacing any previous value.
    async fn save(&self, key: &str, blob: &[u8]) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Return the most recent blob for `key`, or `None` if nothing was saved.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, Box<dyn Error + Send + Sync>>;
}

/// Process-local [`SessionStore`] backed by a map. State does not survive a
/// restart; useful for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemorySessionStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs (diagnostics and tests).
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// Whether the store holds no blobs.
    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, key: &str, blob: &[u8]) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.blobs
            .write()
            .await
            .insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, Box<dyn Error + Send + Sync>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }
}

/// File-backed [`SessionStore`]: one blob file per key under `dir`.
///
/// The blob is written verbatim; an embedder that needs encryption at rest
/// wraps this store (or provides its own) and owns the key material — the
/// core never interprets blob contents.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Create a store rooted at `dir`. The directory is created lazily on the
    /// first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.blob", fingerprint(key)))
    }

    /// The directory this store writes to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Hex SHA-256 of a persistence key, used as a filesystem-safe file name.
pub fn fingerprint(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, key: &str, blob: &[u8]) -> Result<(), Box<dyn Error + Send + Sync>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.blob_path(key);
        tokio::fs::write(&path, blob).await?;
        log::debug!("session blob saved: key={} path={}", key, path.display());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, Box<dyn Error + Send + Sync>> {
        let path = self.blob_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_save_load() {
        let store = InMemorySessionStore::new();
        assert!(store.load("billing-c1").await.unwrap().is_none());

        store.save("billing-c1", b"blob-1").await.unwrap();
        assert_eq!(
            store.load("billing-c1").await.unwrap(),
            Some(b"blob-1".to_vec())
        );

        // Last write wins.
        store.save("billing-c1", b"blob-2").await.unwrap();
        assert_eq!(
            store.load("billing-c1").await.unwrap(),
            Some(b"blob-2".to_vec())
        );
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());

        assert!(store.load("billing-c1").await.unwrap().is_none());
        store.save("billing-c1", b"payload").await.unwrap();
        assert_eq!(
            store.load("billing-c1").await.unwrap(),
            Some(b"payload".to_vec())
        );
    }

    #[tokio::test]
    async fn test_file_store_keys_do_not_touch_path_syntax() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());

        let hostile = "billing-../../etc/passwd";
        store.save(hostile, b"x").await.unwrap();
        assert_eq!(store.load(hostile).await.unwrap(), Some(b"x".to_vec()));

        // Exactly one file, named by the fingerprint.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_fingerprint_is_stable_and_hex() {
        let fp = fingerprint("billing-c1");
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint("billing-c1"));
        assert_ne!(fp, fingerprint("billing-c2"));
    }
}
