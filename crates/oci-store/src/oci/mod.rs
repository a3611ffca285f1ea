//! Stores backed by the OCI image layout.
//!
//! The layout is the on-disk contract shared by every tool in the
//! ecosystem:
//!
//! ```text
//! <root>/
//!   oci-layout                  {"imageLayoutVersion":"1.0.0"}
//!   index.json                  OCI image index of tagged manifests
//!   blobs/<algo>/<hex>          raw blob bytes
//!   ingest/                     temp files while a push is streaming
//! ```
//!
//! [`OciStore`] owns a layout read-write; [`ReadOnlyOciStore`] serves an
//! existing layout from a directory or straight out of a tar archive.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};

mod readonly;
mod storage;
mod store;

pub use readonly::{DirFs, ReadOnlyFs, ReadOnlyOciStore, TarFs};
pub use storage::{
    ANNOTATION_RESUME_FILENAME, ANNOTATION_RESUME_HASH, ANNOTATION_RESUME_OFFSET,
};
pub use store::OciStore;

pub(crate) use storage::OciStorage;

/// Name of the layout marker file.
pub const OCI_LAYOUT_FILE: &str = "oci-layout";
/// Name of the index file tracking tagged manifests.
pub const INDEX_FILE: &str = "index.json";
/// Directory holding blobs, keyed `<algo>/<hex>`.
pub const BLOBS_DIR: &str = "blobs";
/// Directory holding in-flight push temp files.
pub const INGEST_DIR: &str = "ingest";
/// The only layout version this crate speaks.
pub const LAYOUT_VERSION: &str = "1.0.0";

/// The `oci-layout` marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciLayout {
    /// The layout version; must be [`LAYOUT_VERSION`].
    #[serde(rename = "imageLayoutVersion")]
    pub image_layout_version: String,
}

impl Default for OciLayout {
    fn default() -> Self {
        OciLayout {
            image_layout_version: LAYOUT_VERSION.to_owned(),
        }
    }
}

impl OciLayout {
    /// Decodes a marker file and checks the version.
    pub fn validate(content: &[u8]) -> Result<OciLayout> {
        let layout: OciLayout = serde_json::from_slice(content)?;
        if layout.image_layout_version != LAYOUT_VERSION {
            return Err(StoreError::UnsupportedVersion(layout.image_layout_version));
        }
        Ok(layout)
    }
}
