//! Storage engines for OCI artifacts.
//!
//! Three interchangeable stores keep blobs addressed by digest and overlay
//! them with a manifest graph and a tag index:
//!
//! * [`MemoryStore`] holds everything in memory.
//! * [`OciStore`] persists blobs on disk in the standard OCI image layout,
//!   with `index.json` tracking tagged manifests. A read-only variant,
//!   [`ReadOnlyOciStore`], serves an existing layout from a directory or a
//!   tar archive.
//! * [`FileStore`] maps blobs to real files under a working directory using
//!   their title annotation, with a content-addressed fallback for unnamed
//!   blobs.
//!
//! All of them speak the same contract, expressed by the traits in this
//! module: [`Fetcher`] and [`Storage`] for content, [`TagResolver`] for
//! references, and [`PredecessorLister`] for reverse graph queries.
//!
//! # Example
//! ```no_run
//! use oci_content::Descriptor;
//! use oci_store::{MemoryStore, Storage, TagResolver};
//!
//! # async fn example() -> oci_store::Result<()> {
//! let store = MemoryStore::new();
//! let blob = b"hello world";
//! let desc = Descriptor::from_bytes("application/octet-stream", blob);
//! store.push(&desc, Box::new(std::io::Cursor::new(&blob[..]))).await?;
//! store.tag(&desc, "latest").await?;
//! let resolved = store.resolve("latest").await?;
//! assert_eq!(desc.digest, resolved.digest);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

use async_trait::async_trait;
use oci_content::Descriptor;
use tokio::io::AsyncRead;

pub mod cas;
pub mod errors;
pub mod file;
pub mod graph;
pub mod memory;
pub mod oci;
pub mod resolver;
pub mod sync;

pub use cas::{LimitedStorage, MemoryCas};
pub use errors::{Result, StoreError};
pub use file::{FileStore, FileStoreOptions};
pub use graph::{DeletableGraph, PredecessorGraph};
pub use memory::MemoryStore;
pub use oci::{OciStore, ReadOnlyOciStore};
pub use resolver::TagStore;

/// A readable blob stream handed out by a store.
pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

/// Read access to content by descriptor.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Opens the content identified by `target` for reading.
    ///
    /// The returned stream is *not* re-verified; stores verify on push and
    /// keep committed content immutable.
    async fn fetch(&self, target: &Descriptor) -> Result<ContentReader>;
}

/// Write access to content, layered over [`Fetcher`].
#[async_trait]
pub trait Storage: Fetcher {
    /// Whether the content identified by `target` is present.
    async fn exists(&self, target: &Descriptor) -> Result<bool>;

    /// Streams `content` into the store, verifying it against `expected`.
    ///
    /// The content is only observable by other operations once `push`
    /// returns success.
    async fn push(&self, expected: &Descriptor, content: ContentReader) -> Result<()>;
}

/// Mapping between reference strings and descriptors.
#[async_trait]
pub trait TagResolver: Send + Sync {
    /// Resolves a reference to the descriptor it was tagged with.
    async fn resolve(&self, reference: &str) -> Result<Descriptor>;

    /// Tags `desc` under `reference`, overwriting any previous binding.
    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()>;
}

/// Reverse-edge queries over the manifest graph.
#[async_trait]
pub trait PredecessorLister: Send + Sync {
    /// Returns every known manifest that directly references `node`.
    /// Unknown nodes yield an empty list. Order is unspecified.
    async fn predecessors(&self, node: &Descriptor) -> Result<Vec<Descriptor>>;
}

/// The full storage contract: content plus tags.
pub trait Target: Storage + TagResolver {}

impl<T: Storage + TagResolver + ?Sized> Target for T {}

/// A [`Target`] that also answers predecessor queries.
pub trait GraphTarget: Target + PredecessorLister {}

impl<T: Target + PredecessorLister + ?Sized> GraphTarget for T {}
