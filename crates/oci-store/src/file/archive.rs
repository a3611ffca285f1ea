//! Tar+gzip packing and unpacking for directory blobs.
//!
//! Everything here is synchronous and meant to run under
//! `tokio::task::spawn_blocking`. Extraction is hostile-input safe: every
//! entry must resolve inside the destination, link targets included, and a
//! symlinked prefix cannot smuggle a write outside it.

use std::collections::VecDeque;
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use oci_content::{Algorithm, ContentError, Digest, Digester};
use tar::{EntryType, HeaderMode};
use tracing::debug;

use crate::errors::{Result, StoreError};

/// A writer tee that digests and counts everything written through it.
struct DigestWriter<W: Write> {
    inner: W,
    digester: Digester,
    count: u64,
}

impl<W: Write> DigestWriter<W> {
    fn new(inner: W, algorithm: Algorithm) -> DigestWriter<W> {
        DigestWriter {
            inner,
            digester: algorithm.digester(),
            count: 0,
        }
    }

    fn into_parts(self) -> (W, Digester, u64) {
        (self.inner, self.digester, self.count)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A reader tee that digests everything read through it.
struct DigestReader<R: Read> {
    inner: R,
    digester: Option<Digester>,
}

impl<R: Read> DigestReader<R> {
    fn new(inner: R, digester: Option<Digester>) -> DigestReader<R> {
        DigestReader { inner, digester }
    }

    fn into_digest(self) -> Option<Digest> {
        self.digester.map(Digester::finalize)
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(digester) = self.digester.as_mut() {
            digester.update(&buf[..n]);
        }
        Ok(n)
    }
}

/// What [`pack_directory`] produced.
pub(crate) struct PackResult {
    /// Digest of the gzipped stream (the blob itself).
    pub gz_digest: Digest,
    /// Digest of the uncompressed tar stream.
    pub tar_digest: Digest,
    /// Size of the gzipped stream in bytes.
    pub size: i64,
}

/// Packs `src` into a gzipped tar at `out`.
///
/// Entries are written in sorted order. With `reproducible`, timestamps,
/// owners, and permissions are normalized so identical trees produce
/// identical bytes.
pub(crate) fn pack_directory(src: &Path, out: &Path, reproducible: bool) -> Result<PackResult> {
    let file = std::fs::File::create(out)?;
    let gz_tee = DigestWriter::new(file, Algorithm::Sha256);
    let encoder = GzEncoder::new(gz_tee, Compression::default());
    let tar_tee = DigestWriter::new(encoder, Algorithm::Sha256);

    let mode = if reproducible {
        HeaderMode::Deterministic
    } else {
        HeaderMode::Complete
    };

    let mut builder = tar::Builder::new(tar_tee);
    builder.follow_symlinks(false);
    builder.mode(mode);

    // Breadth-first with sorted names keeps the archive deterministic.
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(PathBuf::new());
    while let Some(rel) = queue.pop_front() {
        let abs = src.join(&rel);
        let mut children: Vec<_> = std::fs::read_dir(&abs)?.collect::<io::Result<_>>()?;
        children.sort_by_key(|entry| entry.file_name());
        for child in children {
            let child_rel = rel.join(child.file_name());
            let child_abs = child.path();
            let file_type = child.file_type()?;
            if file_type.is_dir() {
                builder.append_path_with_name(&child_abs, &child_rel)?;
                queue.push_back(child_rel);
            } else {
                builder.append_path_with_name(&child_abs, &child_rel)?;
            }
        }
    }

    let tar_tee = builder.into_inner()?;
    let (encoder, tar_digester, _) = tar_tee.into_parts();
    let gz_tee = encoder.finish()?;
    let (file, gz_digester, size) = gz_tee.into_parts();
    file.sync_all()?;

    let result = PackResult {
        gz_digest: gz_digester.finalize(),
        tar_digest: tar_digester.finalize(),
        size: size as i64,
    };
    debug!(src = %src.display(), digest = %result.gz_digest, size = result.size, "packed directory");
    Ok(result)
}

/// Extracts the gzipped tar at `archive` into `dst`.
///
/// When `expected_tar` is given, the uncompressed tar stream (trailer and
/// padding included) is digested and checked against it after extraction.
pub(crate) fn unpack_archive(
    archive: &Path,
    dst: &Path,
    expected_tar: Option<&Digest>,
) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    let dst_real = dst.canonicalize()?;

    let file = std::fs::File::open(archive)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let mut reader = DigestReader::new(decoder, expected_tar.map(|d| d.algorithm().digester()));

    {
        let mut tar = tar::Archive::new(&mut reader);
        for entry in tar.entries()? {
            let mut entry = entry?;
            let rel = entry.path()?.into_owned();
            let target = safe_join(&dst_real, &rel)?;
            match entry.header().entry_type() {
                EntryType::Directory => {
                    std::fs::create_dir_all(&target)?;
                    ensure_within(&dst_real, &target)?;
                }
                EntryType::Symlink => {
                    let link = entry
                        .link_name()?
                        .ok_or_else(|| StoreError::InvalidPath(rel.display().to_string()))?
                        .into_owned();
                    validate_link_target(&dst_real, &target, &link)?;
                    prepare_parent(&dst_real, &target)?;
                    make_symlink(&link, &target)?;
                }
                EntryType::Link => {
                    let link = entry
                        .link_name()?
                        .ok_or_else(|| StoreError::InvalidPath(rel.display().to_string()))?
                        .into_owned();
                    let source = safe_join(&dst_real, &link)?;
                    prepare_parent(&dst_real, &target)?;
                    std::fs::hard_link(&source, &target)?;
                }
                EntryType::Regular | EntryType::Continuous => {
                    prepare_parent(&dst_real, &target)?;
                    entry.unpack(&target)?;
                }
                // PAX headers and other special members carry no payload
                // worth materializing.
                _ => continue,
            }
        }
    }

    // Drain the trailer so the tar digest covers the whole stream.
    io::copy(&mut reader, &mut io::sink())?;
    if let Some(expected) = expected_tar {
        let computed = reader.into_digest().expect("digester was installed");
        if computed != *expected {
            return Err(StoreError::Content(ContentError::MismatchedDigest {
                expected: expected.clone(),
                computed,
            }));
        }
    }
    Ok(())
}

/// Joins an archive-relative path onto `base`, refusing anything that could
/// step outside it.
fn safe_join(base: &Path, rel: &Path) -> Result<PathBuf> {
    let mut joined = base.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::PathTraversalDisallowed(rel.to_path_buf()))
            }
        }
    }
    Ok(joined)
}

/// Creates `target`'s parent and confirms it (symlinks resolved) is still
/// inside the destination.
fn prepare_parent(dst_real: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
        ensure_within(dst_real, parent)?;
    }
    Ok(())
}

fn ensure_within(dst_real: &Path, dir: &Path) -> Result<()> {
    let real = dir.canonicalize()?;
    if !real.starts_with(dst_real) {
        return Err(StoreError::PathTraversalDisallowed(dir.to_path_buf()));
    }
    Ok(())
}

/// Checks a symlink target: resolved against the link's own directory it
/// must stay inside the destination.
fn validate_link_target(dst_real: &Path, link_path: &Path, target: &Path) -> Result<()> {
    let resolved = if target.is_absolute() {
        target.to_path_buf()
    } else {
        let base = link_path.parent().unwrap_or(dst_real);
        base.join(target)
    };
    if !lexical_normalize(&resolved).starts_with(dst_real) {
        return Err(StoreError::PathTraversalDisallowed(target.to_path_buf()));
    }
    Ok(())
}

/// Resolves `.` and `..` components without touching the file system.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::RootDir | Component::Prefix(_) => normalized.push(component.as_os_str()),
        }
    }
    normalized
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    let _ = std::fs::remove_file(target);
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(_link: &Path, _target: &Path) -> Result<()> {
    Err(StoreError::Unsupported(
        "symlink extraction on this platform".to_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tree(root: &Path) {
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("test.txt"), b"hello world").unwrap();
        std::fs::write(root.join("sub/nested.txt"), b"nested").unwrap();
    }

    #[test]
    fn pack_then_unpack_round_trips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("src");
        write_tree(&src);
        let blob = dir.path().join("blob.tar.gz");

        let packed = pack_directory(&src, &blob, false)?;
        assert_eq!(packed.size, std::fs::metadata(&blob)?.len() as i64);

        let out = dir.path().join("out");
        unpack_archive(&blob, &out, Some(&packed.tar_digest))?;
        assert_eq!(b"hello world".to_vec(), std::fs::read(out.join("test.txt"))?);
        assert_eq!(b"nested".to_vec(), std::fs::read(out.join("sub/nested.txt"))?);
        Ok(())
    }

    #[test]
    fn reproducible_packs_are_stable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("src");
        write_tree(&src);

        let a = pack_directory(&src, &dir.path().join("a.tar.gz"), true)?;
        // Touch mtimes, then pack again.
        std::fs::write(src.join("test.txt"), b"hello world")?;
        let b = pack_directory(&src, &dir.path().join("b.tar.gz"), true)?;
        assert_eq!(a.tar_digest, b.tar_digest);
        Ok(())
    }

    #[test]
    fn wrong_tar_digest_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("src");
        write_tree(&src);
        let blob = dir.path().join("blob.tar.gz");
        pack_directory(&src, &blob, false)?;

        let wrong = Digest::from_bytes(Algorithm::Sha256, b"not the tar stream");
        let err = unpack_archive(&blob, &dir.path().join("out"), Some(&wrong)).unwrap_err();
        assert!(err.is_mismatched_digest());
        Ok(())
    }

    fn gz_tar<F>(build: F) -> Vec<u8>
    where
        F: FnOnce(&mut tar::Builder<&mut Vec<u8>>),
    {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            build(&mut builder);
            builder.finish().unwrap();
        }
        let mut gz = Vec::new();
        {
            let mut encoder = GzEncoder::new(&mut gz, Compression::default());
            encoder.write_all(&tar_bytes).unwrap();
            encoder.finish().unwrap();
        }
        gz
    }

    #[test]
    fn entries_escaping_the_destination_are_refused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let evil = gz_tar(|builder| {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(4);
            // `append_data` validates the path and rejects `..`, but that is
            // exactly the archive this test needs to build, so the raw name
            // bytes are written directly instead of going through it.
            let name = &mut header.as_old_mut().name;
            name[.."../evil.txt".len()].copy_from_slice(b"../evil.txt");
            header.set_cksum();
            builder.append(&header, &b"evil"[..]).unwrap();
        });
        let archive = dir.path().join("evil.tar.gz");
        std::fs::write(&archive, evil)?;

        let err = unpack_archive(&archive, &dir.path().join("out"), None).unwrap_err();
        assert!(err.is_path_traversal());
        assert!(!dir.path().join("evil.txt").exists());
        Ok(())
    }

    #[test]
    fn symlinks_escaping_the_destination_are_refused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let evil = gz_tar(|builder| {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, "escape", "../../outside")
                .unwrap();
        });
        let archive = dir.path().join("evil.tar.gz");
        std::fs::write(&archive, evil)?;

        let err = unpack_archive(&archive, &dir.path().join("out"), None).unwrap_err();
        assert!(err.is_path_traversal());
        Ok(())
    }
}
