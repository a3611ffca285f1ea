//! The fully in-memory store.

use std::collections::HashMap;

use async_trait::async_trait;
use oci_content::Descriptor;

use crate::cas::MemoryCas;
use crate::errors::{Result, StoreError};
use crate::graph::PredecessorGraph;
use crate::resolver::TagStore;
use crate::{ContentReader, Fetcher, PredecessorLister, Storage, TagResolver};

/// Content-addressed storage, tags, and the predecessor graph, all in
/// memory. Content lives until the store is dropped; nothing is ever
/// deleted.
pub struct MemoryStore {
    cas: MemoryCas,
    tags: TagStore,
    graph: PredecessorGraph,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> MemoryStore {
        MemoryStore {
            cas: MemoryCas::new(),
            tags: TagStore::new(),
            graph: PredecessorGraph::new(),
        }
    }

    /// Removes a tag. Unknown references are a no-op; the content stays.
    pub fn untag(&self, reference: &str) {
        self.tags.untag(reference);
    }

    /// A snapshot of every tag binding. Ordering is unspecified.
    pub fn tags(&self) -> HashMap<String, Descriptor> {
        self.tags.map()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

#[async_trait]
impl Fetcher for MemoryStore {
    async fn fetch(&self, target: &Descriptor) -> Result<ContentReader> {
        self.cas.fetch(target).await
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn exists(&self, target: &Descriptor) -> Result<bool> {
        self.cas.exists(target).await
    }

    async fn push(&self, expected: &Descriptor, content: ContentReader) -> Result<()> {
        self.cas.push(expected, content).await?;
        self.graph.index(&self.cas, expected).await
    }
}

#[async_trait]
impl TagResolver for MemoryStore {
    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        self.tags.resolve(reference)
    }

    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
        if !self.cas.exists(desc).await? {
            return Err(StoreError::NotFound(desc.digest.to_string()));
        }
        self.tags.tag(desc, reference)
    }
}

#[async_trait]
impl PredecessorLister for MemoryStore {
    async fn predecessors(&self, node: &Descriptor) -> Result<Vec<Descriptor>> {
        Ok(self.graph.predecessors(node))
    }
}
