//! Errors raised while parsing or verifying content.

use crate::digest::Digest;

/// Errors produced by the content layer: digest parsing, descriptor
/// validation, manifest decoding, and verified reads.
///
/// Callers are expected to match on the variant to recover the error kind;
/// every variant carries enough context to be meaningful in a log line.
#[derive(thiserror::Error, Debug)]
pub enum ContentError {
    /// The digest string is malformed or its hex does not fit the algorithm.
    #[error("invalid digest {digest:?}: {reason}")]
    InvalidDigest {
        /// The offending digest string.
        digest: String,
        /// Short description of what was wrong with it.
        reason: &'static str,
    },

    /// The digest algorithm is not one this crate knows how to compute.
    #[error("unsupported digest algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    /// The content hashed to a different digest than the descriptor declared.
    #[error("mismatched digest: expected {expected}, computed {computed}")]
    MismatchedDigest {
        /// The digest the descriptor declared.
        expected: Digest,
        /// The digest actually computed over the stream.
        computed: Digest,
    },

    /// The stream kept producing bytes past the descriptor's declared size.
    #[error("content for {0} has trailing data past the declared size")]
    TrailingData(Digest),

    /// Verification was requested before the stream was fully consumed.
    #[error("verify called after {read} of {expected} bytes were read")]
    EarlyVerify {
        /// Bytes consumed so far.
        read: u64,
        /// Bytes the descriptor declared.
        expected: u64,
    },

    /// The stream ended before the declared size was reached.
    #[error("unexpected end of stream: read {read} of {expected} bytes")]
    UnexpectedEof {
        /// Bytes consumed before the stream ended.
        read: u64,
        /// Bytes the descriptor declared.
        expected: u64,
    },

    /// The descriptor declares a negative size, so it cannot be verified.
    #[error("invalid descriptor size {0}")]
    InvalidDescriptorSize(i64),

    /// The declared size is larger than the storage is willing to accept.
    #[error("content size {size} exceeds limit {limit}")]
    SizeExceedsLimit {
        /// The size the descriptor declared.
        size: i64,
        /// The configured cap.
        limit: i64,
    },

    /// A blob with a manifest media type did not decode as that manifest.
    #[error("invalid manifest content: {0}")]
    InvalidManifest(#[from] serde_json::Error),

    /// An I/O error from the underlying stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ContentError {
    /// Recovers a `ContentError` that was tunneled through an
    /// [`std::io::Error`] by the verifying reader; any other I/O error is
    /// wrapped as [`ContentError::Io`].
    pub fn from_io(err: std::io::Error) -> ContentError {
        let is_content = err
            .get_ref()
            .map(|inner| inner.is::<ContentError>())
            .unwrap_or(false);
        if is_content {
            let inner = err.into_inner().expect("checked above");
            *inner.downcast::<ContentError>().expect("checked above")
        } else {
            ContentError::Io(err)
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T, E = ContentError> = std::result::Result<T, E>;
