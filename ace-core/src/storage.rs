//! Content-addressed blob storage.
//!
//! `RootAnalysis.details` and `Analysis.details` carry sha256 handles, never
//! bodies; access is explicit through the store. The filesystem layout is
//! `<root>/<first-2-hex>/<sha256>`.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Lowercase hex sha256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn validate_handle(sha256: &str) -> CoreResult<()> {
    if sha256.len() == 64 && sha256.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    {
        Ok(())
    } else {
        Err(CoreError::validation(format!(
            "malformed blob handle {sha256:?}"
        )))
    }
}

/// Pluggable content-addressed blob store.
pub trait BlobStore: Send + Sync {
    /// Store `data`, returning its lowercase hex sha256 handle.
    fn store(&self, data: &[u8]) -> CoreResult<String>;

    /// Load the blob for a handle, or `None` if absent.
    fn load(&self, sha256: &str) -> CoreResult<Option<Vec<u8>>>;

    /// Delete a blob. Returns whether it existed.
    fn delete(&self, sha256: &str) -> CoreResult<bool>;
}

/// Filesystem-backed store under `ACE_STORAGE_ROOT`.
#[derive(Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, sha256: &str) -> PathBuf {
        self.root.join(&sha256[..2]).join(sha256)
    }
}

impl BlobStore for LocalBlobStore {
    fn store(&self, data: &[u8]) -> CoreResult<String> {
        let handle = sha256_hex(data);
        let path = self.path_for(&handle);
        if !path.exists() {
            fs::create_dir_all(path.parent().expect("blob path has a parent"))?;
            fs::write(&path, data)?;
            debug!(handle = %handle, bytes = data.len(), "stored blob");
        }
        Ok(handle)
    }

    fn load(&self, sha256: &str) -> CoreResult<Option<Vec<u8>>> {
        validate_handle(sha256)?;
        match fs::read(self.path_for(sha256)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, sha256: &str) -> CoreResult<bool> {
        validate_handle(sha256)?;
        match fs::remove_file(self.path_for(sha256)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory store backing unit tests and the in-process composition.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn store(&self, data: &[u8]) -> CoreResult<String> {
        let handle = sha256_hex(data);
        self.blobs.entry(handle.clone()).or_insert_with(|| data.to_vec());
        Ok(handle)
    }

    fn load(&self, sha256: &str) -> CoreResult<Option<Vec<u8>>> {
        validate_handle(sha256)?;
        Ok(self.blobs.get(sha256).map(|blob| blob.clone()))
    }

    fn delete(&self, sha256: &str) -> CoreResult<bool> {
        validate_handle(sha256)?;
        Ok(self.blobs.remove(sha256).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        let handle = store.store(b"whois response body").unwrap();
        assert_eq!(handle.len(), 64);

        assert_eq!(
            store.load(&handle).unwrap().as_deref(),
            Some(b"whois response body".as_slice())
        );
        assert!(store.delete(&handle).unwrap());
        assert_eq!(store.load(&handle).unwrap(), None);
    }

    #[test]
    fn store_is_idempotent_per_content() {
        let store = MemoryBlobStore::new();
        let a = store.store(b"same bytes").unwrap();
        let b = store.store(b"same bytes").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_handles_are_rejected() {
        let store = MemoryBlobStore::new();
        assert!(matches!(
            store.load("../../etc/passwd"),
            Err(CoreError::ValidationFailed { .. })
        ));
        assert!(matches!(
            store.load("ABCDEF"),
            Err(CoreError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn local_store_uses_two_level_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();
        let handle = store.store(b"file content").unwrap();

        let expected = dir.path().join(&handle[..2]).join(&handle);
        assert!(expected.is_file());

        assert_eq!(
            store.load(&handle).unwrap().as_deref(),
            Some(b"file content".as_slice())
        );
        assert!(store.delete(&handle).unwrap());
        assert!(!store.delete(&handle).unwrap());
    }
}
