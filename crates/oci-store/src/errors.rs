//! Errors raised by the storage engines.

use std::path::PathBuf;
use std::sync::Arc;

use oci_content::{ContentError, Digest};

/// Errors produced by the store layer.
///
/// The variant is the error kind: callers dedup on
/// [`StoreError::is_already_exists`], skip on [`StoreError::is_not_found`],
/// and so on. Content-layer failures are carried transparently so their
/// kinds stay matchable through store APIs.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The requested content, reference, or name is not in the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// Content with this digest is already present.
    #[error("content already exists: {0}")]
    AlreadyExists(Digest),

    /// A resolve or tag was attempted with an empty reference.
    #[error("missing reference")]
    MissingReference,

    /// The reference does not satisfy the tag grammar.
    #[error("invalid reference {0:?}")]
    InvalidReference(String),

    /// The on-disk layout declares a version this crate does not speak.
    #[error("unsupported OCI layout version {0:?}")]
    UnsupportedVersion(String),

    /// The operation is not available on this store variant.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A path is not usable for the requested operation.
    #[error("invalid path {0:?}")]
    InvalidPath(String),

    /// Another producer already owns this name.
    #[error("duplicate name {0:?}")]
    DuplicateName(String),

    /// A named operation was attempted without a name.
    #[error("missing name")]
    MissingName,

    /// The target path exists and overwriting is disabled.
    #[error("overwrite of {0:?} is disallowed")]
    OverwriteDisallowed(PathBuf),

    /// The target path escapes the working directory.
    #[error("path {0:?} traverses outside the working directory")]
    PathTraversalDisallowed(PathBuf),

    /// The store has been closed.
    #[error("store is closed")]
    StoreClosed,

    /// Closing the store could not remove some temporary files.
    #[error("failed to remove {} temporary file(s)", .0.len())]
    Cleanup(Vec<(PathBuf, std::io::Error)>),

    /// An error shared between concurrent callers of a merged operation.
    #[error("{0}")]
    Shared(Arc<StoreError>),

    /// A content-layer failure (digest, size, or manifest decoding).
    #[error(transparent)]
    Content(#[from] ContentError),

    /// An I/O failure outside the verified read path.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed JSON in a layout file.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Unwraps a shared error when this caller holds the last reference,
    /// otherwise keeps it shared.
    pub fn from_shared(err: Arc<StoreError>) -> StoreError {
        match Arc::try_unwrap(err) {
            Ok(err) => err,
            Err(err) => StoreError::Shared(err),
        }
    }

    /// Whether this error (or the error it shares) is a not-found.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    /// Whether this error is an already-exists.
    pub fn is_already_exists(&self) -> bool {
        match self {
            StoreError::AlreadyExists(_) => true,
            StoreError::Shared(inner) => inner.is_already_exists(),
            _ => false,
        }
    }

    /// Whether this error is a duplicate-name.
    pub fn is_duplicate_name(&self) -> bool {
        match self {
            StoreError::DuplicateName(_) => true,
            StoreError::Shared(inner) => inner.is_duplicate_name(),
            _ => false,
        }
    }

    /// Whether this error is a refused path traversal.
    pub fn is_path_traversal(&self) -> bool {
        match self {
            StoreError::PathTraversalDisallowed(_) => true,
            StoreError::Shared(inner) => inner.is_path_traversal(),
            _ => false,
        }
    }

    /// Whether this error is a digest mismatch from a verified read.
    pub fn is_mismatched_digest(&self) -> bool {
        match self {
            StoreError::Content(ContentError::MismatchedDigest { .. }) => true,
            StoreError::Shared(inner) => inner.is_mismatched_digest(),
            _ => false,
        }
    }

    /// Whether this error marks an unsupported operation.
    pub fn is_unsupported(&self) -> bool {
        match self {
            StoreError::Unsupported(_) => true,
            StoreError::Shared(inner) => inner.is_unsupported(),
            _ => false,
        }
    }
}

/// Maps an I/O error to not-found for the given description, passing other
/// kinds through.
pub(crate) fn io_not_found(err: std::io::Error, what: impl Into<String>) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(what.into())
    } else {
        StoreError::Io(err)
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
