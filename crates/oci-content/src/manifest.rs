//! OCI manifest models and successor extraction.
//!
//! A small set of media types marks a blob as a *manifest*: a JSON document
//! whose descriptors reference other blobs. Everything else is opaque.

use std::collections::{BTreeMap, HashMap};

use crate::descriptor::Descriptor;
use crate::errors::Result;

/// The mediatype for an OCI image manifest.
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// The mediatype for an OCI image index.
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// The mediatype for an OCI artifact manifest.
pub const MEDIA_TYPE_ARTIFACT_MANIFEST: &str = "application/vnd.oci.artifact.manifest.v1+json";
/// The mediatype Docker uses for an image manifest.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// The mediatype Docker uses for a manifest list.
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// The mediatype for an image config.
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// The mediatype for an uncompressed layer.
pub const MEDIA_TYPE_IMAGE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
/// The mediatype for a gzipped layer.
pub const MEDIA_TYPE_IMAGE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// How a media type participates in the manifest graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestKind {
    /// An image manifest (OCI or Docker v2): references a config and layers.
    Image,
    /// An index or manifest list: references other manifests.
    Index,
    /// An artifact manifest: references arbitrary blobs.
    Artifact,
    /// Anything else. Opaque to the graph.
    Foreign,
}

impl ManifestKind {
    /// Classifies a media type.
    pub fn of(media_type: &str) -> ManifestKind {
        match media_type {
            MEDIA_TYPE_IMAGE_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST => ManifestKind::Image,
            MEDIA_TYPE_IMAGE_INDEX | MEDIA_TYPE_DOCKER_MANIFEST_LIST => ManifestKind::Index,
            MEDIA_TYPE_ARTIFACT_MANIFEST => ManifestKind::Artifact,
            _ => ManifestKind::Foreign,
        }
    }

    /// Whether blobs of this kind are parsed for successors.
    pub fn is_manifest(&self) -> bool {
        !matches!(self, ManifestKind::Foreign)
    }
}

/// Whether a media type belongs to the manifest set.
pub fn is_manifest(media_type: &str) -> bool {
    ManifestKind::of(media_type).is_manifest()
}

/// An OCI image manifest (also decodes Docker v2 image manifests).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// The only allowed value is 2. Lenient on decode: manifests in the
    /// wild sometimes omit it.
    #[serde(default)]
    pub schema_version: i32,

    /// Reserved for compatibility; usually set to the manifest media type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// The type of an artifact packaged as an image manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// The image configuration. Required by the specification, but decoded
    /// leniently.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,

    /// The ordered layers.
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// A manifest this one attaches to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    /// Manifest-level annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,

    /// Unknown fields, retained for round-tripping.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// An OCI image index (also decodes Docker manifest lists). Doubles as the
/// model for an image layout's `index.json`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// The only allowed value is 2. Lenient on decode.
    #[serde(default)]
    pub schema_version: i32,

    /// Reserved for compatibility.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// The type of an artifact packaged as an index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// The referenced manifests.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,

    /// A manifest this index attaches to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    /// Index-level annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,

    /// Unknown fields, retained for round-tripping.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        ImageIndex {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_INDEX.to_owned()),
            artifact_type: None,
            manifests: Vec::new(),
            subject: None,
            annotations: None,
            extra: BTreeMap::new(),
        }
    }
}

/// An OCI artifact manifest.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactManifest {
    /// Always `application/vnd.oci.artifact.manifest.v1+json`.
    pub media_type: String,

    /// The type of the artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// The blobs the artifact consists of.
    #[serde(default)]
    pub blobs: Vec<Descriptor>,

    /// A manifest this artifact attaches to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    /// Artifact-level annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Extracts the descriptors a manifest directly references.
///
/// `content` must be the full blob bytes for `desc`. For non-manifest media
/// types this returns an empty list without touching the content.
pub fn successors(desc: &Descriptor, content: &[u8]) -> Result<Vec<Descriptor>> {
    let mut nodes = Vec::new();
    match ManifestKind::of(&desc.media_type) {
        ManifestKind::Image => {
            let manifest: ImageManifest = serde_json::from_slice(content)?;
            nodes.extend(manifest.config);
            nodes.extend(manifest.layers);
            nodes.extend(manifest.subject);
        }
        ManifestKind::Index => {
            let index: ImageIndex = serde_json::from_slice(content)?;
            nodes.extend(index.manifests);
            nodes.extend(index.subject);
        }
        ManifestKind::Artifact => {
            let artifact: ArtifactManifest = serde_json::from_slice(content)?;
            nodes.extend(artifact.blobs);
            nodes.extend(artifact.subject);
        }
        ManifestKind::Foreign => {}
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(media_type: &str, content: &[u8]) -> Descriptor {
        Descriptor::from_bytes(media_type, content)
    }

    #[test]
    fn classifies_media_types() {
        assert_eq!(ManifestKind::Image, ManifestKind::of(MEDIA_TYPE_IMAGE_MANIFEST));
        assert_eq!(ManifestKind::Image, ManifestKind::of(MEDIA_TYPE_DOCKER_MANIFEST));
        assert_eq!(ManifestKind::Index, ManifestKind::of(MEDIA_TYPE_IMAGE_INDEX));
        assert_eq!(
            ManifestKind::Index,
            ManifestKind::of(MEDIA_TYPE_DOCKER_MANIFEST_LIST)
        );
        assert_eq!(
            ManifestKind::Artifact,
            ManifestKind::of(MEDIA_TYPE_ARTIFACT_MANIFEST)
        );
        assert!(!is_manifest("application/octet-stream"));
    }

    #[test]
    fn image_manifest_successors() {
        let config = desc(MEDIA_TYPE_IMAGE_CONFIG, b"{}");
        let layer = desc(MEDIA_TYPE_IMAGE_LAYER, b"layer data");
        let subject = desc(MEDIA_TYPE_IMAGE_MANIFEST, b"subject");
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": &config,
            "layers": [&layer],
            "subject": &subject,
        });
        let content = serde_json::to_vec(&manifest).unwrap();
        let node = desc(MEDIA_TYPE_IMAGE_MANIFEST, &content);

        let succ = successors(&node, &content).expect("manifest should parse");
        assert_eq!(3, succ.len());
        assert_eq!(config.digest, succ[0].digest);
        assert_eq!(layer.digest, succ[1].digest);
        assert_eq!(subject.digest, succ[2].digest);
    }

    #[test]
    fn index_successors() {
        let m1 = desc(MEDIA_TYPE_IMAGE_MANIFEST, b"one");
        let m2 = desc(MEDIA_TYPE_IMAGE_MANIFEST, b"two");
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [&m1, &m2],
        });
        let content = serde_json::to_vec(&index).unwrap();
        let node = desc(MEDIA_TYPE_IMAGE_INDEX, &content);

        let succ = successors(&node, &content).expect("index should parse");
        assert_eq!(vec![m1.digest, m2.digest], succ.iter().map(|d| d.digest.clone()).collect::<Vec<_>>());
    }

    #[test]
    fn artifact_successors() {
        let blob = desc("application/octet-stream", b"payload");
        let artifact = serde_json::json!({
            "mediaType": MEDIA_TYPE_ARTIFACT_MANIFEST,
            "artifactType": "application/vnd.example+type",
            "blobs": [&blob],
        });
        let content = serde_json::to_vec(&artifact).unwrap();
        let node = desc(MEDIA_TYPE_ARTIFACT_MANIFEST, &content);

        let succ = successors(&node, &content).expect("artifact should parse");
        assert_eq!(1, succ.len());
        assert_eq!(blob.digest, succ[0].digest);
    }

    #[test]
    fn foreign_blobs_have_no_successors() {
        let node = desc("test", b"not json at all");
        let succ = successors(&node, b"not json at all").unwrap();
        assert!(succ.is_empty());
    }

    #[test]
    fn index_json_round_trips_unknown_fields() {
        let raw = r#"{
            "schemaVersion": 2,
            "manifests": [],
            "x-custom": {"kept": true}
        }"#;
        let index: ImageIndex = serde_json::from_str(raw).unwrap();
        let out = serde_json::to_value(&index).unwrap();
        assert_eq!(serde_json::json!({"kept": true}), out["x-custom"]);
        assert_eq!(2, out["schemaVersion"]);
    }
}
