//! The on-disk content-addressable half of an OCI layout.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use oci_content::{ContentError, Descriptor, Digest, Digester, VerifyReader};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{BLOBS_DIR, INGEST_DIR};
use crate::errors::{io_not_found, Result, StoreError};
use crate::sync::{KeyedLocks, OnceOrRetry};
use crate::{ContentReader, Fetcher, Storage};

/// Annotation carrying the byte offset at which to resume an interrupted
/// push. The ingest file named by [`ANNOTATION_RESUME_FILENAME`] must hold
/// exactly that many bytes.
pub const ANNOTATION_RESUME_OFFSET: &str = "io.ocistore.ingest.resume-offset";

/// Annotation carrying the hex digest of the first `resume-offset` bytes,
/// used to check the recovered hash state. When it does not decode or does
/// not match, the transfer silently restarts from offset zero.
pub const ANNOTATION_RESUME_HASH: &str = "io.ocistore.ingest.resume-hash";

/// Annotation naming the ingest file of the interrupted push. Must live
/// inside the store's `ingest/` directory.
pub const ANNOTATION_RESUME_FILENAME: &str = "io.ocistore.ingest.resume-filename";

struct ResumeRequest {
    offset: u64,
    hash: Option<String>,
    filename: PathBuf,
}

impl ResumeRequest {
    fn from_descriptor(desc: &Descriptor) -> Option<ResumeRequest> {
        let offset = desc.annotation(ANNOTATION_RESUME_OFFSET)?.parse().ok()?;
        let filename = PathBuf::from(desc.annotation(ANNOTATION_RESUME_FILENAME)?);
        Some(ResumeRequest {
            offset,
            hash: desc
                .annotation(ANNOTATION_RESUME_HASH)
                .map(str::to_owned),
            filename,
        })
    }
}

/// Blob storage at `<root>/blobs/<algo>/<hex>` with temp-then-rename pushes
/// staged under `<root>/ingest/`.
///
/// Committed blobs are immutable, so reads never lock; concurrent pushes of
/// the same digest serialize on a per-digest lock so only one ingest runs.
pub(crate) struct OciStorage {
    root: PathBuf,
    ingest_init: OnceOrRetry,
    push_locks: KeyedLocks<Digest>,
}

impl OciStorage {
    pub(crate) fn new(root: PathBuf) -> OciStorage {
        OciStorage {
            root,
            ingest_init: OnceOrRetry::new(),
            push_locks: KeyedLocks::new(),
        }
    }

    pub(crate) fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(BLOBS_DIR)
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    fn ingest_dir(&self) -> PathBuf {
        self.root.join(INGEST_DIR)
    }

    async fn ensure_ingest_dir(&self) -> Result<()> {
        let dir = self.ingest_dir();
        self.ingest_init
            .call(|| async move { fs::create_dir_all(&dir).await.map_err(StoreError::Io) })
            .await
    }

    pub(crate) async fn delete(&self, target: &Descriptor) -> Result<()> {
        let path = self.blob_path(&target.digest);
        fs::remove_file(&path)
            .await
            .map_err(|err| io_not_found(err, target.digest.to_string()))?;
        debug!(digest = %target.digest, "deleted blob");
        Ok(())
    }

    /// Removes ingest leftovers last modified before `cutoff`. Files from
    /// in-flight pushes are newer than any sensible cutoff and survive.
    pub(crate) async fn sweep_ingest(&self, cutoff: SystemTime) -> Result<()> {
        let mut entries = match fs::read_dir(self.ingest_dir()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StoreError::Io(err)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let stale = meta
                .modified()
                .map(|modified| modified < cutoff)
                .unwrap_or(false);
            if stale {
                if let Err(err) = fs::remove_file(entry.path()).await {
                    warn!(path = %entry.path().display(), %err, "could not sweep stale ingest file");
                }
            }
        }
        Ok(())
    }

    /// Streams the remaining bytes of a resumed push, or restarts from
    /// offset zero when the recorded hash state cannot be reproduced.
    async fn push_resumed(
        &self,
        expected: &Descriptor,
        content: ContentReader,
        resume: ResumeRequest,
        blob_path: &Path,
    ) -> Result<()> {
        let ingest_path = resume.filename.clone();
        let result = self
            .write_resumed(expected, content, resume, blob_path)
            .await;
        if result.is_err() {
            let _ = fs::remove_file(&ingest_path).await;
        }
        result
    }

    async fn write_resumed(
        &self,
        expected: &Descriptor,
        content: ContentReader,
        resume: ResumeRequest,
        blob_path: &Path,
    ) -> Result<()> {
        if !resume.filename.starts_with(self.ingest_dir()) {
            return Err(StoreError::InvalidPath(
                resume.filename.display().to_string(),
            ));
        }
        let algorithm = expected.digest.algorithm();
        let seeded = recover_prefix_state(
            &resume.filename,
            resume.offset,
            resume.hash.as_deref(),
            algorithm,
        )
        .await;

        let (digester, offset, file) = match seeded {
            Some(digester) => {
                let file = fs::OpenOptions::new()
                    .append(true)
                    .open(&resume.filename)
                    .await?;
                (digester, resume.offset, file)
            }
            None => {
                // The fallback is silent towards the caller; the full blob
                // is simply transferred again.
                warn!(
                    digest = %expected.digest,
                    "resume hash state could not be recovered; re-transferring from offset 0"
                );
                let file = fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&resume.filename)
                    .await?;
                (algorithm.digester(), 0, file)
            }
        };

        let mut file = file;
        let mut verified = VerifyReader::resume(content, expected, digester, offset)?;
        tokio::io::copy(&mut verified, &mut file)
            .await
            .map_err(|err| StoreError::from(ContentError::from_io(err)))?;
        verified.verify().await?;
        file.flush().await?;
        drop(file);

        commit(&resume.filename, blob_path).await
    }

    async fn push_fresh(
        &self,
        expected: &Descriptor,
        content: ContentReader,
        blob_path: &Path,
    ) -> Result<()> {
        let ingest_dir = self.ingest_dir();
        let prefix = format!(
            "{}_{}_",
            expected.digest.algorithm(),
            expected.digest.hex()
        );
        // The temp file cleans itself up if anything below fails.
        let temp = tempfile::Builder::new()
            .prefix(&prefix)
            .tempfile_in(&ingest_dir)?;
        let std_file = temp.as_file().try_clone()?;
        let mut file = fs::File::from_std(std_file);

        let mut verified = VerifyReader::new(content, expected)?;
        tokio::io::copy(&mut verified, &mut file)
            .await
            .map_err(|err| StoreError::from(ContentError::from_io(err)))?;
        verified.verify().await?;
        file.flush().await?;
        drop(file);

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        temp.persist(blob_path).map_err(|err| StoreError::Io(err.error))?;
        Ok(())
    }
}

#[async_trait]
impl Fetcher for OciStorage {
    async fn fetch(&self, target: &Descriptor) -> Result<ContentReader> {
        let path = self.blob_path(&target.digest);
        let file = fs::File::open(&path)
            .await
            .map_err(|err| io_not_found(err, target.digest.to_string()))?;
        Ok(Box::new(file))
    }
}

#[async_trait]
impl Storage for OciStorage {
    async fn exists(&self, target: &Descriptor) -> Result<bool> {
        match fs::metadata(self.blob_path(&target.digest)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn push(&self, expected: &Descriptor, content: ContentReader) -> Result<()> {
        let blob_path = self.blob_path(&expected.digest);
        if self.exists(expected).await? {
            return Err(StoreError::AlreadyExists(expected.digest.clone()));
        }

        let _guard = self.push_locks.lock(expected.digest.clone()).await;
        // A concurrent push may have committed while we waited.
        if self.exists(expected).await? {
            return Err(StoreError::AlreadyExists(expected.digest.clone()));
        }
        self.ensure_ingest_dir().await?;

        debug!(digest = %expected.digest, size = expected.size, "ingesting blob");
        match ResumeRequest::from_descriptor(expected) {
            Some(resume) => self.push_resumed(expected, content, resume, &blob_path).await,
            None => self.push_fresh(expected, content, &blob_path).await,
        }
    }
}

/// Re-derives the digest state of an ingest file's first `offset` bytes.
///
/// Returns `None` whenever the state cannot be trusted: the file is missing
/// or has a different length, or the declared prefix hash does not match.
async fn recover_prefix_state(
    path: &Path,
    offset: u64,
    declared_hash: Option<&str>,
    algorithm: oci_content::Algorithm,
) -> Option<Digester> {
    let meta = fs::metadata(path).await.ok()?;
    if meta.len() != offset {
        return None;
    }
    let mut digester = algorithm.digester();
    let mut file = fs::File::open(path).await.ok()?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
    }
    if let Some(declared) = declared_hash {
        if digester.current().hex() != declared {
            return None;
        }
    }
    Some(digester)
}

async fn commit(ingest: &Path, blob_path: &Path) -> Result<()> {
    if let Some(parent) = blob_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(ingest, blob_path).await?;
    Ok(())
}
