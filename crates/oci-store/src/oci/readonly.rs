//! Read-only OCI layout access, from a live directory or a tar archive.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use oci_content::manifest::ImageIndex;
use oci_content::{Descriptor, Digest, ANNOTATION_REF_NAME};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use super::{OciLayout, BLOBS_DIR, INDEX_FILE, OCI_LAYOUT_FILE};
use crate::errors::{io_not_found, Result, StoreError};
use crate::graph::PredecessorGraph;
use crate::resolver::TagStore;
use crate::{ContentReader, Fetcher};

/// Minimal read access to a file tree, keyed by forward-slash names.
#[async_trait]
pub trait ReadOnlyFs: Send + Sync {
    /// Opens a regular file for reading.
    async fn open(&self, name: &str) -> Result<ContentReader>;

    /// Whether a regular file with this name exists.
    async fn exists(&self, name: &str) -> Result<bool>;
}

/// A [`ReadOnlyFs`] over a directory on disk.
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    /// Serves files under `root`.
    pub fn new(root: impl Into<PathBuf>) -> DirFs {
        DirFs { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in name.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(StoreError::InvalidPath(name.to_owned())),
                segment => path.push(segment),
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl ReadOnlyFs for DirFs {
    async fn open(&self, name: &str) -> Result<ContentReader> {
        if name.ends_with('/') {
            return Err(StoreError::InvalidPath(name.to_owned()));
        }
        let path = self.resolve(name)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|err| io_not_found(err, name))?;
        Ok(Box::new(file))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.resolve(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum TarEntryKind {
    File,
    Directory,
    Other,
}

struct TarEntry {
    offset: u64,
    size: u64,
    kind: TarEntryKind,
}

/// A [`ReadOnlyFs`] over a tar archive.
///
/// The archive is scanned once at open time to record each member's data
/// offset; reads then seek straight to the member, so a fetch never touches
/// more of the archive than the blob itself.
pub struct TarFs {
    path: PathBuf,
    entries: HashMap<String, TarEntry>,
}

impl TarFs {
    /// Indexes the archive at `path`.
    pub async fn new(path: impl Into<PathBuf>) -> Result<TarFs> {
        let path = path.into();
        let indexed = path.clone();
        let entries = tokio::task::spawn_blocking(move || index_tar(&indexed))
            .await
            .map_err(|err| StoreError::Io(std::io::Error::other(err)))??;
        debug!(path = %path.display(), entries = entries.len(), "indexed tar archive");
        Ok(TarFs { path, entries })
    }
}

fn index_tar(path: &Path) -> Result<HashMap<String, TarEntry>> {
    let file = std::fs::File::open(path)?;
    let mut archive = tar::Archive::new(file);
    let mut entries = HashMap::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let name = name.trim_start_matches("./").trim_end_matches('/').to_owned();
        if name.is_empty() {
            continue;
        }
        let kind = match entry.header().entry_type() {
            tar::EntryType::Regular => TarEntryKind::File,
            tar::EntryType::Directory => TarEntryKind::Directory,
            _ => TarEntryKind::Other,
        };
        entries.insert(
            name,
            TarEntry {
                offset: entry.raw_file_position(),
                size: entry.size(),
                kind,
            },
        );
    }
    Ok(entries)
}

#[async_trait]
impl ReadOnlyFs for TarFs {
    async fn open(&self, name: &str) -> Result<ContentReader> {
        if name.ends_with('/') {
            return Err(StoreError::InvalidPath(name.to_owned()));
        }
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        match entry.kind {
            TarEntryKind::File => {}
            TarEntryKind::Directory => {
                return Err(StoreError::Unsupported(format!(
                    "open of tar directory entry {name:?}"
                )))
            }
            TarEntryKind::Other => {
                return Err(StoreError::Unsupported(format!(
                    "open of non-regular tar entry {name:?}"
                )))
            }
        }
        let mut file = fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(entry.offset)).await?;
        Ok(Box::new(file.take(entry.size)))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .entries
            .get(name)
            .map(|entry| entry.kind == TarEntryKind::File)
            .unwrap_or(false))
    }
}

/// Read-only access to an existing OCI layout.
///
/// Opening validates `oci-layout`, loads `index.json`, tags every listed
/// descriptor (by `ref.name` annotation and by digest), and rebuilds the
/// predecessor graph. There is no push, tag, or delete.
pub struct ReadOnlyOciStore<FS> {
    fs: FS,
    tags: TagStore,
    graph: PredecessorGraph,
}

impl ReadOnlyOciStore<DirFs> {
    /// Opens a layout directory read-only.
    pub async fn from_dir(root: impl Into<PathBuf>) -> Result<ReadOnlyOciStore<DirFs>> {
        ReadOnlyOciStore::from_fs(DirFs::new(root)).await
    }
}

impl ReadOnlyOciStore<TarFs> {
    /// Opens a tar archive containing a layout.
    pub async fn from_tar(path: impl Into<PathBuf>) -> Result<ReadOnlyOciStore<TarFs>> {
        ReadOnlyOciStore::from_fs(TarFs::new(path).await?).await
    }
}

impl<FS: ReadOnlyFs> ReadOnlyOciStore<FS> {
    /// Opens a layout served by an arbitrary [`ReadOnlyFs`].
    pub async fn from_fs(fs: FS) -> Result<ReadOnlyOciStore<FS>> {
        let store = ReadOnlyOciStore {
            fs,
            tags: TagStore::new(),
            graph: PredecessorGraph::new(),
        };
        let layout = store.read_file(OCI_LAYOUT_FILE).await?;
        OciLayout::validate(&layout)?;

        let index: ImageIndex = serde_json::from_slice(&store.read_file(INDEX_FILE).await?)?;
        for desc in &index.manifests {
            if let Some(reference) = desc.annotation(ANNOTATION_REF_NAME) {
                if !reference.is_empty() {
                    store.tags.tag(desc, reference)?;
                }
            }
            store.tags.tag(desc, &desc.digest.to_string())?;
        }
        for desc in &index.manifests {
            store.graph.index_all(&store, desc).await?;
        }
        Ok(store)
    }

    /// Resolves a reference to its descriptor.
    pub async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        self.tags.resolve(reference)
    }

    /// Whether the content identified by `target` is present.
    pub async fn exists(&self, target: &Descriptor) -> Result<bool> {
        self.fs.exists(&blob_name(&target.digest)).await
    }

    /// Every known manifest that directly references `node`.
    pub async fn predecessors(&self, node: &Descriptor) -> Result<Vec<Descriptor>> {
        Ok(self.graph.predecessors(node))
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let mut reader = self.fs.open(name).await?;
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        Ok(content)
    }
}

#[async_trait]
impl<FS: ReadOnlyFs> Fetcher for ReadOnlyOciStore<FS> {
    async fn fetch(&self, target: &Descriptor) -> Result<ContentReader> {
        self.fs
            .open(&blob_name(&target.digest))
            .await
            .map_err(|err| match err {
                StoreError::NotFound(_) => StoreError::NotFound(target.digest.to_string()),
                other => other,
            })
    }
}

fn blob_name(digest: &Digest) -> String {
    format!("{}/{}/{}", BLOBS_DIR, digest.algorithm(), digest.hex())
}
