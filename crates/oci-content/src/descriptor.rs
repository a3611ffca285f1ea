//! The OCI descriptor: the universal identity record for a blob.

use std::collections::{BTreeMap, HashMap};

use crate::digest::{Algorithm, Digest};

/// Annotation key for a human-readable title, used by file-backed stores to
/// derive an on-disk path.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

/// Annotation key carrying the reference a descriptor was tagged under when
/// it is serialized into an image index.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Annotation marking a blob as a gzipped tar archive that file-backed
/// stores should materialize as a directory.
pub const ANNOTATION_UNPACK: &str = "io.ocistore.content.unpack";

/// Annotation carrying the digest of the uncompressed tar stream inside a
/// gzipped directory blob.
pub const ANNOTATION_UNCOMPRESSED_DIGEST: &str = "io.ocistore.content.uncompressed-digest";

/// The OCI descriptor, as defined by the image specification.
///
/// Unknown fields are retained in `extra` so that descriptors read from an
/// `index.json` round-trip byte-for-meaning even when they carry properties
/// this crate does not model.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The media type of the referenced content.
    pub media_type: String,

    /// The digest of the referenced content.
    pub digest: Digest,

    /// The size of the referenced content in bytes. `-1` means unknown and
    /// is rejected by any verifying read.
    pub size: i64,

    /// Optional download locations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,

    /// Arbitrary annotations. Not part of content identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,

    /// The type of an artifact when the descriptor points at one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// The platform of the referenced content, carried opaquely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<serde_json::Value>,

    /// A descriptor this one declares as its subject.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Box<Descriptor>>,

    /// Any other OCI descriptor fields, passed through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Descriptor {
    /// Creates a minimal descriptor from its identity triple.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: i64) -> Descriptor {
        Descriptor {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
            artifact_type: None,
            platform: None,
            subject: None,
            extra: BTreeMap::new(),
        }
    }

    /// Describes an in-memory blob, computing its SHA-256 digest.
    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Descriptor {
        Descriptor::new(
            media_type,
            Digest::from_bytes(Algorithm::Sha256, bytes),
            bytes.len() as i64,
        )
    }

    /// Looks up an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Sets an annotation, creating the map if needed.
    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
    }

    /// Removes an annotation; drops the map once it is empty.
    pub fn remove_annotation(&mut self, key: &str) {
        if let Some(annotations) = self.annotations.as_mut() {
            annotations.remove(key);
            if annotations.is_empty() {
                self.annotations = None;
            }
        }
    }

    /// The title annotation, when present and non-empty.
    pub fn title(&self) -> Option<&str> {
        self.annotation(ANNOTATION_TITLE).filter(|t| !t.is_empty())
    }

    /// Whether two descriptors refer to the same content. Annotations and
    /// other metadata do not participate.
    pub fn content_equal(&self, other: &Descriptor) -> bool {
        self.digest == other.digest
            && self.size == other.size
            && self.media_type == other.media_type
    }

    /// The identity triple as an owned, hashable key.
    pub fn content_key(&self) -> ContentKey {
        ContentKey {
            digest: self.digest.clone(),
            size: self.size,
            media_type: self.media_type.clone(),
        }
    }

    /// A copy stripped down to the identity triple.
    pub fn plain(&self) -> Descriptor {
        Descriptor::new(self.media_type.clone(), self.digest.clone(), self.size)
    }
}

/// The content-identity triple of a descriptor, used as a map key wherever
/// identical content pushed with different annotations must collapse to one
/// node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContentKey {
    /// The content digest.
    pub digest: Digest,
    /// The declared size.
    pub size: i64,
    /// The media type.
    pub media_type: String,
}
