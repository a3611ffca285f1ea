//! The in-memory tag resolver.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use oci_content::{Descriptor, Digest};

use crate::errors::{Result, StoreError};

#[derive(Default)]
struct TagMaps {
    refs: HashMap<String, Descriptor>,
    by_digest: HashMap<Digest, HashSet<String>>,
}

/// A concurrency-safe mapping from reference strings to descriptors, with a
/// reverse index from digest to the set of references bound to it.
///
/// The resolver never validates descriptors against stored content; the
/// stores that embed it do that before tagging.
pub struct TagStore {
    inner: RwLock<TagMaps>,
}

impl TagStore {
    /// Creates an empty resolver.
    pub fn new() -> TagStore {
        TagStore {
            inner: RwLock::new(TagMaps::default()),
        }
    }

    /// Binds `reference` to `desc`, overwriting any previous binding.
    pub fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
        if reference.is_empty() {
            return Err(StoreError::MissingReference);
        }
        let mut maps = self.inner.write().expect("tag store poisoned");
        if let Some(previous) = maps.refs.insert(reference.to_owned(), desc.clone()) {
            if previous.digest != desc.digest {
                if let Some(set) = maps.by_digest.get_mut(&previous.digest) {
                    set.remove(reference);
                    if set.is_empty() {
                        maps.by_digest.remove(&previous.digest);
                    }
                }
            }
        }
        maps.by_digest
            .entry(desc.digest.clone())
            .or_default()
            .insert(reference.to_owned());
        Ok(())
    }

    /// Resolves `reference` to its descriptor.
    pub fn resolve(&self, reference: &str) -> Result<Descriptor> {
        if reference.is_empty() {
            return Err(StoreError::MissingReference);
        }
        let maps = self.inner.read().expect("tag store poisoned");
        maps.refs
            .get(reference)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(reference.to_owned()))
    }

    /// Removes a binding. Unknown references are a no-op.
    pub fn untag(&self, reference: &str) {
        let mut maps = self.inner.write().expect("tag store poisoned");
        if let Some(desc) = maps.refs.remove(reference) {
            if let Some(set) = maps.by_digest.get_mut(&desc.digest) {
                set.remove(reference);
                if set.is_empty() {
                    maps.by_digest.remove(&desc.digest);
                }
            }
        }
    }

    /// A snapshot of every binding. Ordering is unspecified.
    pub fn map(&self) -> HashMap<String, Descriptor> {
        self.inner.read().expect("tag store poisoned").refs.clone()
    }

    /// The set of references currently bound to content with this digest.
    pub fn tag_set(&self, digest: &Digest) -> HashSet<String> {
        self.inner
            .read()
            .expect("tag store poisoned")
            .by_digest
            .get(digest)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for TagStore {
    fn default() -> Self {
        TagStore::new()
    }
}
