//! The named file store.
//!
//! Blobs carrying a title annotation are materialized as real files (or,
//! for gzipped tar blobs marked for unpacking, directories) under a working
//! directory; everything else lands in a pluggable content-addressed
//! fallback, by default an in-memory map capped at 4 MiB per blob.
//!
//! Every name admits one producer: concurrent pushes of the same title are
//! funneled through a one-shot latch so exactly one writes the file and the
//! rest learn the name is taken.

mod archive;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use oci_content::manifest::{MEDIA_TYPE_IMAGE_LAYER, MEDIA_TYPE_IMAGE_LAYER_GZIP};
use oci_content::{
    is_manifest, read_all, successors, ContentError, Descriptor, Digest, VerifyReader,
    ANNOTATION_TITLE, ANNOTATION_UNCOMPRESSED_DIGEST, ANNOTATION_UNPACK,
};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::cas::{LimitedStorage, MemoryCas};
use crate::errors::{io_not_found, Result, StoreError};
use crate::graph::PredecessorGraph;
use crate::resolver::TagStore;
use crate::sync::{limited_for_each, Latch, LatchState};
use crate::{ContentReader, Fetcher, PredecessorLister, Storage, TagResolver};

/// Cap on blob size in the default in-memory fallback.
pub const DEFAULT_FALLBACK_LIMIT: i64 = 4 * 1024 * 1024;

/// Media type assigned by [`FileStore::add`] to plain files when the caller
/// does not pick one.
pub const DEFAULT_BLOB_MEDIA_TYPE: &str = MEDIA_TYPE_IMAGE_LAYER;

/// Media type assigned by [`FileStore::add`] to packed directories when the
/// caller does not pick one.
pub const DEFAULT_DIRECTORY_MEDIA_TYPE: &str = MEDIA_TYPE_IMAGE_LAYER_GZIP;

const RESTORE_CONCURRENCY: usize = 4;

/// Behavior switches for a [`FileStore`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FileStoreOptions {
    /// Allow titles to resolve outside the working directory.
    pub allow_path_traversal_on_write: bool,
    /// Refuse to write over paths that already exist.
    pub disable_overwrite: bool,
    /// Keep unnamed successors in the fallback instead of promoting them to
    /// named files after a manifest push.
    pub force_cas: bool,
    /// Silently drop manifest-kind pushes that carry no title.
    pub ignore_no_name: bool,
    /// Store directory blobs as their gzipped tar instead of extracting.
    pub skip_unpack: bool,
    /// Normalize timestamps and owners when packing directories, so the
    /// same tree always produces the same blob.
    pub tar_reproducible: bool,
}

enum Claim {
    Producer(Arc<Latch>),
    Waiter(Arc<Latch>),
}

/// A store that keeps named blobs as real files under a working directory.
pub struct FileStore {
    working_dir: PathBuf,
    opts: FileStoreOptions,
    fallback: Box<dyn Storage>,
    tags: TagStore,
    graph: PredecessorGraph,
    digest_to_path: RwLock<HashMap<Digest, PathBuf>>,
    names: Mutex<HashMap<String, Arc<Latch>>>,
    tmp_files: Mutex<HashSet<PathBuf>>,
    closed: AtomicBool,
}

impl FileStore {
    /// Opens a store rooted at `working_dir` with default options and the
    /// default in-memory fallback.
    pub fn new(working_dir: impl AsRef<Path>) -> Result<FileStore> {
        FileStore::with_options(working_dir, FileStoreOptions::default())
    }

    /// Opens a store with explicit options.
    pub fn with_options(working_dir: impl AsRef<Path>, opts: FileStoreOptions) -> Result<FileStore> {
        FileStore::with_fallback(
            working_dir,
            opts,
            Box::new(LimitedStorage::new(MemoryCas::new(), DEFAULT_FALLBACK_LIMIT)),
        )
    }

    /// Opens a store with explicit options and fallback storage for
    /// unnamed blobs.
    pub fn with_fallback(
        working_dir: impl AsRef<Path>,
        opts: FileStoreOptions,
        fallback: Box<dyn Storage>,
    ) -> Result<FileStore> {
        let working_dir = absolutize(working_dir.as_ref())?;
        std::fs::create_dir_all(&working_dir)?;
        Ok(FileStore {
            working_dir,
            opts,
            fallback,
            tags: TagStore::new(),
            graph: PredecessorGraph::new(),
            digest_to_path: RwLock::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            tmp_files: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// The absolute working directory names resolve against.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Describes a local file or directory and registers it under `name`.
    ///
    /// Directories are packed into a gzipped tar held in a temporary file
    /// (removed by [`FileStore::close`]); the returned descriptor carries
    /// the title, the uncompressed digest, and the unpack marker so that
    /// pushing it into another file store recreates the directory. Plain
    /// files are digested in place.
    ///
    /// An empty `media_type` selects [`DEFAULT_BLOB_MEDIA_TYPE`] or
    /// [`DEFAULT_DIRECTORY_MEDIA_TYPE`].
    pub async fn add(
        &self,
        name: &str,
        media_type: &str,
        path: impl AsRef<Path>,
    ) -> Result<Descriptor> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(StoreError::MissingName);
        }
        loop {
            match self.claim_name(name) {
                Claim::Producer(latch) => {
                    let result = self.describe_path(name, media_type, path.as_ref()).await;
                    return match result {
                        Ok((desc, mapped)) => {
                            self.digest_to_path
                                .write()
                                .expect("path map poisoned")
                                .insert(desc.digest.clone(), mapped);
                            latch.commit();
                            Ok(desc)
                        }
                        Err(err) => {
                            self.release_name(name);
                            latch.abort();
                            Err(err)
                        }
                    };
                }
                Claim::Waiter(latch) => match latch.wait().await {
                    LatchState::Committed => {
                        return Err(StoreError::DuplicateName(name.to_owned()))
                    }
                    _ => continue,
                },
            }
        }
    }

    /// Removes every temporary file this store created and marks it closed.
    /// Removal failures are collected, not fatal one by one; the store is
    /// closed regardless.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let temps: Vec<PathBuf> = {
            let mut tmp_files = self.tmp_files.lock().expect("temp set poisoned");
            tmp_files.drain().collect()
        };
        let mut failures = Vec::new();
        for path in temps {
            if let Err(err) = fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), %err, "could not remove temporary file");
                    failures.push((path, err));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Cleanup(failures))
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::StoreClosed);
        }
        Ok(())
    }

    fn claim_name(&self, name: &str) -> Claim {
        let mut names = self.names.lock().expect("name map poisoned");
        match names.entry(name.to_owned()) {
            Entry::Occupied(entry) => Claim::Waiter(entry.get().clone()),
            Entry::Vacant(slot) => {
                let latch = Arc::new(Latch::new());
                slot.insert(latch.clone());
                Claim::Producer(latch)
            }
        }
    }

    fn release_name(&self, name: &str) {
        self.names.lock().expect("name map poisoned").remove(name);
    }

    async fn push_named(&self, expected: &Descriptor, name: &str, content: ContentReader) -> Result<()> {
        loop {
            match self.claim_name(name) {
                Claim::Producer(latch) => {
                    let result = self.write_named(expected, name, content).await;
                    return match result {
                        Ok(mapped) => {
                            self.digest_to_path
                                .write()
                                .expect("path map poisoned")
                                .insert(expected.digest.clone(), mapped);
                            // Commit strictly after the mapping is visible.
                            latch.commit();
                            Ok(())
                        }
                        Err(err) => {
                            self.release_name(name);
                            latch.abort();
                            Err(err)
                        }
                    };
                }
                Claim::Waiter(latch) => match latch.wait().await {
                    LatchState::Committed => {
                        return Err(StoreError::DuplicateName(name.to_owned()))
                    }
                    // The previous producer failed; race for the name again.
                    _ => continue,
                },
            }
        }
    }

    /// Writes a named blob and returns the path that serves later fetches.
    async fn write_named(
        &self,
        expected: &Descriptor,
        name: &str,
        content: ContentReader,
    ) -> Result<PathBuf> {
        let target = self.resolve_write_path(name).await?;
        if expected.annotation(ANNOTATION_UNPACK) == Some("true") && !self.opts.skip_unpack {
            self.write_unpacked(expected, &target, content).await
        } else {
            self.write_file(expected, &target, content).await?;
            Ok(target)
        }
    }

    async fn resolve_write_path(&self, name: &str) -> Result<PathBuf> {
        let target = lexical_join(&self.working_dir, name);
        if !self.opts.allow_path_traversal_on_write && !target.starts_with(&self.working_dir) {
            return Err(StoreError::PathTraversalDisallowed(PathBuf::from(name)));
        }
        if self.opts.disable_overwrite {
            match fs::symlink_metadata(&target).await {
                Ok(_) => return Err(StoreError::OverwriteDisallowed(target)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::Io(err)),
            }
        }
        Ok(target)
    }

    async fn write_file(&self, expected: &Descriptor, target: &Path, content: ContentReader) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let result = async {
            let mut verified = VerifyReader::new(content, expected)?;
            let mut file = fs::File::create(target).await?;
            tokio::io::copy(&mut verified, &mut file)
                .await
                .map_err(|err| StoreError::from(ContentError::from_io(err)))?;
            verified.verify().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(target).await;
        }
        result
    }

    /// Verifies the gzipped tar into a kept temp file, then extracts it
    /// into `target`. The temp file stays around to serve fetches and is
    /// removed on close.
    async fn write_unpacked(
        &self,
        expected: &Descriptor,
        target: &Path,
        content: ContentReader,
    ) -> Result<PathBuf> {
        fs::create_dir_all(target).await?;

        let temp = {
            let dir = self.working_dir.clone();
            tokio::task::spawn_blocking(move || {
                tempfile::Builder::new().prefix(".staging_").tempfile_in(dir)
            })
            .await
            .map_err(blocking_err)??
        };

        let std_file = temp.as_file().try_clone()?;
        let mut file = fs::File::from_std(std_file);
        let mut verified = VerifyReader::new(content, expected)?;
        tokio::io::copy(&mut verified, &mut file)
            .await
            .map_err(|err| StoreError::from(ContentError::from_io(err)))?;
        verified.verify().await?;
        file.sync_all().await?;
        drop(file);

        let expected_tar = expected
            .annotation(ANNOTATION_UNCOMPRESSED_DIGEST)
            .map(Digest::parse)
            .transpose()?;

        let archive_path = temp.path().to_path_buf();
        let dst = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            archive::unpack_archive(&archive_path, &dst, expected_tar.as_ref())
        })
        .await
        .map_err(blocking_err)??;

        let (_file, kept) = temp.keep().map_err(|err| StoreError::Io(err.error))?;
        self.tmp_files
            .lock()
            .expect("temp set poisoned")
            .insert(kept.clone());
        Ok(kept)
    }

    async fn describe_path(
        &self,
        name: &str,
        media_type: &str,
        path: &Path,
    ) -> Result<(Descriptor, PathBuf)> {
        let abs = if path.as_os_str().is_empty() {
            lexical_join(&self.working_dir, name)
        } else {
            absolutize_under(&self.working_dir, path)
        };
        let meta = fs::metadata(&abs).await?;

        if meta.is_dir() {
            let out = {
                let dir = self.working_dir.clone();
                let temp = tokio::task::spawn_blocking(move || {
                    tempfile::Builder::new().prefix(".pack_").tempfile_in(dir)
                })
                .await
                .map_err(blocking_err)??;
                let (_file, kept) = temp.keep().map_err(|err| StoreError::Io(err.error))?;
                kept
            };
            self.tmp_files
                .lock()
                .expect("temp set poisoned")
                .insert(out.clone());

            let reproducible = self.opts.tar_reproducible;
            let src = abs.clone();
            let pack_out = out.clone();
            let packed = tokio::task::spawn_blocking(move || {
                archive::pack_directory(&src, &pack_out, reproducible)
            })
            .await
            .map_err(blocking_err)??;

            let media_type = if media_type.is_empty() {
                DEFAULT_DIRECTORY_MEDIA_TYPE
            } else {
                media_type
            };
            let mut desc = Descriptor::new(media_type, packed.gz_digest, packed.size);
            desc.set_annotation(ANNOTATION_TITLE, name);
            desc.set_annotation(ANNOTATION_UNPACK, "true");
            desc.set_annotation(ANNOTATION_UNCOMPRESSED_DIGEST, packed.tar_digest.to_string());
            Ok((desc, out))
        } else {
            let (digest, size) = digest_file(&abs).await?;
            let media_type = if media_type.is_empty() {
                DEFAULT_BLOB_MEDIA_TYPE
            } else {
                media_type
            };
            let mut desc = Descriptor::new(media_type, digest, size);
            desc.set_annotation(ANNOTATION_TITLE, name);
            Ok((desc, abs))
        }
    }

    /// Indexes a freshly pushed manifest and promotes its titled successors
    /// out of the fallback onto disk.
    async fn index_after_push(&self, expected: &Descriptor) -> Result<()> {
        if !is_manifest(&expected.media_type) {
            return Ok(());
        }
        let reader = self.fetch(expected).await?;
        let content = read_all(reader, expected).await?;
        let children = successors(expected, &content)?;
        self.graph.index_parsed(expected, &children);
        if !self.opts.force_cas {
            self.restore_duplicates(children).await?;
        }
        Ok(())
    }

    /// For each titled child currently present only in the fallback, writes
    /// it to its named location. A name that is already committed wins
    /// silently; the restore is for idempotence, not arbitration.
    async fn restore_duplicates(&self, children: Vec<Descriptor>) -> Result<()> {
        let named: Vec<Descriptor> = children
            .into_iter()
            .filter(|child| child.title().is_some())
            .collect();
        limited_for_each(RESTORE_CONCURRENCY, named, |child| async move {
            let name = child.title().expect("filtered above").to_owned();
            match self.fallback.fetch(&child).await {
                Err(err) if err.is_not_found() => Ok(()),
                Err(err) => Err(err),
                Ok(reader) => match self.push_named(&child, &name, reader).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_duplicate_name() => {
                        debug!(name = %name, "restore skipped: name already committed");
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
            }
        })
        .await
    }
}

#[async_trait]
impl Fetcher for FileStore {
    async fn fetch(&self, target: &Descriptor) -> Result<ContentReader> {
        self.ensure_open()?;
        let name = match target.title() {
            None => return self.fallback.fetch(target).await,
            Some(name) => name,
        };
        let latch = {
            let names = self.names.lock().expect("name map poisoned");
            names.get(name).cloned()
        }
        .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        if latch.wait().await != LatchState::Committed {
            return Err(StoreError::NotFound(name.to_owned()));
        }
        let path = self
            .digest_to_path
            .read()
            .expect("path map poisoned")
            .get(&target.digest)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(target.digest.to_string()))?;
        let file = fs::File::open(&path)
            .await
            .map_err(|err| io_not_found(err, target.digest.to_string()))?;
        Ok(Box::new(file))
    }
}

#[async_trait]
impl Storage for FileStore {
    async fn exists(&self, target: &Descriptor) -> Result<bool> {
        self.ensure_open()?;
        let name = match target.title() {
            None => return self.fallback.exists(target).await,
            Some(name) => name,
        };
        let committed = {
            let names = self.names.lock().expect("name map poisoned");
            names
                .get(name)
                .map(|latch| latch.state() == LatchState::Committed)
                .unwrap_or(false)
        };
        if !committed {
            return Ok(false);
        }
        Ok(self
            .digest_to_path
            .read()
            .expect("path map poisoned")
            .contains_key(&target.digest))
    }

    async fn push(&self, expected: &Descriptor, content: ContentReader) -> Result<()> {
        self.ensure_open()?;
        match expected.title() {
            None => {
                if self.opts.ignore_no_name && is_manifest(&expected.media_type) {
                    debug!(digest = %expected.digest, "dropping unnamed manifest");
                    return Ok(());
                }
                self.fallback.push(expected, content).await?;
            }
            Some(name) => {
                let name = name.to_owned();
                self.push_named(expected, &name, content).await?;
            }
        }
        self.index_after_push(expected).await
    }
}

#[async_trait]
impl TagResolver for FileStore {
    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        self.ensure_open()?;
        self.tags.resolve(reference)
    }

    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.exists(desc).await? {
            return Err(StoreError::NotFound(desc.digest.to_string()));
        }
        self.tags.tag(desc, reference)
    }
}

#[async_trait]
impl PredecessorLister for FileStore {
    async fn predecessors(&self, node: &Descriptor) -> Result<Vec<Descriptor>> {
        self.ensure_open()?;
        Ok(self.graph.predecessors(node))
    }
}

fn blocking_err(err: tokio::task::JoinError) -> StoreError {
    StoreError::Io(std::io::Error::other(err))
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn absolutize_under(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Joins a name onto an absolute base, resolving `.` and `..` lexically.
/// `..` may step above the base; the caller decides whether that is
/// allowed. Rooted names are treated as relative.
fn lexical_join(base: &Path, name: &str) -> PathBuf {
    let mut joined = base.to_path_buf();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                joined.pop();
            }
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    joined
}

async fn digest_file(path: &Path) -> Result<(Digest, i64)> {
    let mut file = fs::File::open(path).await?;
    let mut digester = oci_content::Algorithm::Sha256.digester();
    let mut size: i64 = 0;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
        size += n as i64;
    }
    Ok((digester.finalize(), size))
}
