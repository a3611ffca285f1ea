//! In-memory content-addressable storage.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use oci_content::{read_all, ContentError, Descriptor, Digest};
use tracing::debug;

use crate::errors::{Result, StoreError};
use crate::{ContentReader, Fetcher, Storage};

/// A concurrency-safe digest-to-bytes map.
///
/// Content is verified on push; fetches hand out cheap clones of the stored
/// bytes.
pub struct MemoryCas {
    blobs: RwLock<HashMap<Digest, Bytes>>,
}

impl MemoryCas {
    /// Creates an empty store.
    pub fn new() -> MemoryCas {
        MemoryCas {
            blobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCas {
    fn default() -> Self {
        MemoryCas::new()
    }
}

#[async_trait]
impl Fetcher for MemoryCas {
    async fn fetch(&self, target: &Descriptor) -> Result<ContentReader> {
        let blobs = self.blobs.read().expect("memory cas poisoned");
        let bytes = blobs
            .get(&target.digest)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(target.digest.to_string()))?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}

#[async_trait]
impl Storage for MemoryCas {
    async fn exists(&self, target: &Descriptor) -> Result<bool> {
        let blobs = self.blobs.read().expect("memory cas poisoned");
        Ok(blobs.contains_key(&target.digest))
    }

    async fn push(&self, expected: &Descriptor, content: ContentReader) -> Result<()> {
        if self.exists(expected).await? {
            return Err(StoreError::AlreadyExists(expected.digest.clone()));
        }
        let bytes = read_all(content, expected).await?;
        debug!(digest = %expected.digest, size = expected.size, "storing blob in memory");
        let mut blobs = self.blobs.write().expect("memory cas poisoned");
        // A racing push may have won while we were reading.
        if blobs.contains_key(&expected.digest) {
            return Err(StoreError::AlreadyExists(expected.digest.clone()));
        }
        blobs.insert(expected.digest.clone(), Bytes::from(bytes));
        Ok(())
    }
}

/// Wraps a storage and rejects pushes whose descriptor declares a size
/// above a fixed cap. Reads pass through untouched.
pub struct LimitedStorage<S> {
    inner: S,
    limit: i64,
}

impl<S: Storage> LimitedStorage<S> {
    /// Caps pushes into `inner` at `limit` bytes of declared size.
    pub fn new(inner: S, limit: i64) -> LimitedStorage<S> {
        LimitedStorage { inner, limit }
    }
}

#[async_trait]
impl<S: Storage> Fetcher for LimitedStorage<S> {
    async fn fetch(&self, target: &Descriptor) -> Result<ContentReader> {
        self.inner.fetch(target).await
    }
}

#[async_trait]
impl<S: Storage> Storage for LimitedStorage<S> {
    async fn exists(&self, target: &Descriptor) -> Result<bool> {
        self.inner.exists(target).await
    }

    async fn push(&self, expected: &Descriptor, content: ContentReader) -> Result<()> {
        if expected.size > self.limit {
            return Err(StoreError::Content(ContentError::SizeExceedsLimit {
                size: expected.size,
                limit: self.limit,
            }));
        }
        self.inner.push(expected, content).await
    }
}
