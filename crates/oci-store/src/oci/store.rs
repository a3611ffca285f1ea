//! The read-write OCI layout store.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use lazy_static::lazy_static;
use oci_content::manifest::ImageIndex;
use oci_content::{is_manifest, Descriptor, Digest, ANNOTATION_REF_NAME};
use regex::Regex;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::{OciLayout, OciStorage, INDEX_FILE, OCI_LAYOUT_FILE};
use crate::errors::{Result, StoreError};
use crate::graph::{DeletableGraph, PredecessorGraph};
use crate::resolver::TagStore;
use crate::sync::Wharf;
use crate::{ContentReader, Fetcher, PredecessorLister, Storage, TagResolver};

lazy_static! {
    // The OCI tag grammar: alphanumeric or underscore start, then up to 127
    // characters of [A-Za-z0-9._-].
    static ref REFERENCE_PATTERN: Regex =
        Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").expect("static regex");
}

enum GraphIndex {
    Append(PredecessorGraph),
    Deletable(DeletableGraph),
}

impl GraphIndex {
    async fn index<F: Fetcher + ?Sized>(&self, fetcher: &F, node: &Descriptor) -> Result<()> {
        match self {
            GraphIndex::Append(graph) => graph.index(fetcher, node).await,
            GraphIndex::Deletable(graph) => graph.index(fetcher, node).await,
        }
    }

    async fn index_all<F: Fetcher + ?Sized>(&self, fetcher: &F, root: &Descriptor) -> Result<()> {
        match self {
            GraphIndex::Append(graph) => graph.index_all(fetcher, root).await,
            GraphIndex::Deletable(graph) => graph.index_all(fetcher, root).await,
        }
    }

    fn predecessors(&self, node: &Descriptor) -> Vec<Descriptor> {
        match self {
            GraphIndex::Append(graph) => graph.predecessors(node),
            GraphIndex::Deletable(graph) => graph.predecessors(node),
        }
    }

    fn remove(&self, node: &Descriptor) -> Result<()> {
        match self {
            GraphIndex::Append(_) => Err(StoreError::Unsupported(
                "delete on an append-only store".to_owned(),
            )),
            GraphIndex::Deletable(graph) => {
                graph.remove(node);
                Ok(())
            }
        }
    }
}

/// A store persisting blobs in the OCI image layout under a root directory.
///
/// Opening validates (or creates) the `oci-layout` marker, loads
/// `index.json`, tags every listed descriptor by its `ref.name` annotation
/// and by its digest, and rebuilds the predecessor graph from the reachable
/// manifests.
///
/// By default every mutation of the tag set rewrites `index.json`
/// ([`OciStore::set_auto_save_index`] turns that off in favor of explicit
/// [`OciStore::save_index`] calls). The deletable variant created by
/// [`OciStore::new_deletable`] additionally supports [`OciStore::delete`].
pub struct OciStore {
    root: PathBuf,
    storage: OciStorage,
    tags: TagStore,
    graph: GraphIndex,
    deletable: bool,
    auto_save_index: AtomicBool,
    // Readers share, mutators exclude: index.json is never serialized in
    // the middle of a tag/push/delete.
    lock: RwLock<()>,
    index_saver: Wharf<(), StoreError>,
    index_template: Mutex<ImageIndex>,
    opened_at: SystemTime,
}

impl OciStore {
    /// Opens (or initializes) the layout at `root`.
    pub async fn new(root: impl Into<PathBuf>) -> Result<OciStore> {
        OciStore::open(root.into(), false).await
    }

    /// Opens (or initializes) the layout at `root` with delete support.
    pub async fn new_deletable(root: impl Into<PathBuf>) -> Result<OciStore> {
        OciStore::open(root.into(), true).await
    }

    #[instrument(level = "debug", skip(root), fields(root = %root.display()))]
    async fn open(root: PathBuf, deletable: bool) -> Result<OciStore> {
        fs::create_dir_all(&root).await?;
        let graph = if deletable {
            GraphIndex::Deletable(DeletableGraph::new())
        } else {
            GraphIndex::Append(PredecessorGraph::new())
        };
        let store = OciStore {
            storage: OciStorage::new(root.clone()),
            tags: TagStore::new(),
            graph,
            deletable,
            auto_save_index: AtomicBool::new(true),
            lock: RwLock::new(()),
            index_saver: Wharf::new(),
            index_template: Mutex::new(ImageIndex::default()),
            opened_at: SystemTime::now(),
            root,
        };
        store.ensure_layout_file().await?;
        store.load_index().await?;
        Ok(store)
    }

    /// Controls whether tag mutations rewrite `index.json` immediately.
    pub fn set_auto_save_index(&self, auto: bool) {
        self.auto_save_index.store(auto, Ordering::Relaxed);
    }

    /// The root directory of the layout.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    async fn ensure_layout_file(&self) -> Result<()> {
        let path = self.root.join(OCI_LAYOUT_FILE);
        match fs::read(&path).await {
            Ok(content) => {
                OciLayout::validate(&content)?;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let content = serde_json::to_vec(&OciLayout::default())?;
                fs::write(&path, content).await?;
                Ok(())
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn load_index(&self) -> Result<()> {
        let path = self.root.join(INDEX_FILE);
        let index: ImageIndex = match fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StoreError::Io(err)),
        };

        let entries = index.manifests.clone();
        {
            let mut template = self.index_template.lock().expect("index template poisoned");
            *template = ImageIndex {
                manifests: Vec::new(),
                ..index
            };
        }

        for desc in &entries {
            if let Some(reference) = desc.annotation(ANNOTATION_REF_NAME) {
                if !reference.is_empty() {
                    self.tags.tag(desc, reference)?;
                }
            }
            self.tags.tag(desc, &desc.digest.to_string())?;
        }
        for desc in &entries {
            self.graph.index_all(&self.storage, desc).await?;
        }
        Ok(())
    }

    /// Serializes the current tag set into `index.json`.
    ///
    /// A descriptor appears once per human reference (each copy carrying
    /// its own `ref.name` annotation); a descriptor tagged only by its
    /// digest appears exactly once, without `ref.name`.
    pub async fn save_index(&self) -> Result<()> {
        self.index_saver
            .dock((), |_tickets| async move {
                // Saving takes exclusive access like every other mutation,
                // so a snapshot can never interleave with a push or delete.
                let _guard = self.lock.write().await;
                self.write_index_snapshot().await
            })
            .await
            .map_err(StoreError::from_shared)
    }

    async fn write_index_snapshot(&self) -> Result<()> {
        let map = self.tags.map();
        let mut entries: Vec<Descriptor> = Vec::new();
        let mut human_tagged: HashSet<Digest> = HashSet::new();

        for (reference, desc) in &map {
            if *reference != desc.digest.to_string() {
                let mut entry = desc.clone();
                entry.set_annotation(ANNOTATION_REF_NAME, reference.clone());
                entries.push(entry);
                human_tagged.insert(desc.digest.clone());
            }
        }
        for (reference, desc) in &map {
            if *reference == desc.digest.to_string() && !human_tagged.contains(&desc.digest) {
                let mut entry = desc.clone();
                entry.remove_annotation(ANNOTATION_REF_NAME);
                entries.push(entry);
            }
        }
        entries.sort_by_key(|entry| {
            (
                entry.digest.to_string(),
                entry
                    .annotation(ANNOTATION_REF_NAME)
                    .unwrap_or_default()
                    .to_owned(),
            )
        });

        let index = {
            let template = self.index_template.lock().expect("index template poisoned");
            ImageIndex {
                manifests: entries,
                ..template.clone()
            }
        };
        let content = serde_json::to_vec(&index)?;
        fs::write(self.root.join(INDEX_FILE), content).await?;
        debug!(manifests = index.manifests.len(), "wrote index.json");
        Ok(())
    }

    /// Removes a reference. The content itself stays; with auto-save on,
    /// `index.json` is rewritten.
    pub async fn untag(&self, reference: &str) -> Result<()> {
        {
            let _guard = self.lock.write().await;
            self.tags.resolve(reference)?;
            self.tags.untag(reference);
        }
        if self.auto_save() {
            self.save_index().await?;
        }
        Ok(())
    }

    /// A snapshot of every tag binding. Ordering is unspecified.
    pub async fn tags(&self) -> HashMap<String, Descriptor> {
        let _guard = self.lock.read().await;
        self.tags.map()
    }

    /// Removes content from the store (deletable variant only): every
    /// reference to it is dropped, its graph edges are retracted, and
    /// `index.json` is rewritten before the blob itself is unlinked, so a
    /// failure can only leave a stale blob behind, never a dangling index
    /// entry.
    #[instrument(level = "debug", skip(self, target), fields(digest = %target.digest))]
    pub async fn delete(&self, target: &Descriptor) -> Result<()> {
        if !self.deletable {
            return Err(StoreError::Unsupported(
                "delete on a non-deletable OCI store".to_owned(),
            ));
        }
        let _guard = self.lock.write().await;
        if !self.storage.exists(target).await? {
            return Err(StoreError::NotFound(target.digest.to_string()));
        }
        for reference in self.tags.tag_set(&target.digest) {
            self.tags.untag(&reference);
        }
        self.graph.remove(target)?;
        self.write_index_snapshot().await?;
        self.storage.delete(target).await?;
        self.storage.sweep_ingest(self.opened_at).await?;
        Ok(())
    }

    fn auto_save(&self) -> bool {
        self.auto_save_index.load(Ordering::Relaxed)
    }
}

fn validate_reference(reference: &str, digest: &Digest) -> Result<()> {
    if reference.is_empty() {
        return Err(StoreError::MissingReference);
    }
    let bare = reference.strip_prefix('@').unwrap_or(reference);
    if let Ok(parsed) = Digest::parse(bare) {
        // Tagging by digest is allowed only when it names the same content.
        if parsed != *digest {
            return Err(StoreError::InvalidReference(reference.to_owned()));
        }
        return Ok(());
    }
    if !REFERENCE_PATTERN.is_match(reference) {
        return Err(StoreError::InvalidReference(reference.to_owned()));
    }
    Ok(())
}

#[async_trait]
impl Fetcher for OciStore {
    async fn fetch(&self, target: &Descriptor) -> Result<ContentReader> {
        let _guard = self.lock.read().await;
        self.storage.fetch(target).await
    }
}

#[async_trait]
impl Storage for OciStore {
    async fn exists(&self, target: &Descriptor) -> Result<bool> {
        let _guard = self.lock.read().await;
        self.storage.exists(target).await
    }

    async fn push(&self, expected: &Descriptor, content: ContentReader) -> Result<()> {
        let manifest = is_manifest(&expected.media_type);
        {
            let _guard = self.lock.write().await;
            self.storage.push(expected, content).await?;
            self.graph.index(&self.storage, expected).await?;
            if manifest {
                // Registries always serve a manifest by its digest; mirror
                // that by tagging it under its own digest string.
                self.tags.tag(expected, &expected.digest.to_string())?;
            }
        }
        if manifest && self.auto_save() {
            self.save_index().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TagResolver for OciStore {
    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        let _guard = self.lock.read().await;
        if reference.is_empty() {
            return Err(StoreError::MissingReference);
        }
        let desc = self.tags.resolve(reference)?;
        if self.deletable && reference == desc.digest.to_string() {
            // A digest lookup names content, not a tag; hand back a copy
            // without tag bookkeeping.
            return Ok(desc.plain());
        }
        Ok(desc)
    }

    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
        {
            let _guard = self.lock.write().await;
            validate_reference(reference, &desc.digest)?;
            if !self.storage.exists(desc).await? {
                return Err(StoreError::NotFound(desc.digest.to_string()));
            }
            let digest_string = desc.digest.to_string();
            if reference != digest_string {
                let mut named = desc.clone();
                named.set_annotation(ANNOTATION_REF_NAME, reference);
                self.tags.tag(&named, reference)?;
            }
            self.tags.tag(desc, &digest_string)?;
        }
        if self.auto_save() {
            self.save_index().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PredecessorLister for OciStore {
    async fn predecessors(&self, node: &Descriptor) -> Result<Vec<Descriptor>> {
        let _guard = self.lock.read().await;
        Ok(self.graph.predecessors(node))
    }
}
