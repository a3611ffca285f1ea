//! Content identity for OCI artifacts.
//!
//! This crate holds the pieces of the OCI data model that do not touch
//! storage: algorithm-qualified [`Digest`]s, the [`Descriptor`] identity
//! record, the manifest models with their successor extraction, and the
//! [`VerifyReader`] that enforces a descriptor's declared size and digest on
//! any stream.
//!
//! Storage engines live in the companion `oci-store` crate and are built
//! entirely on the types defined here.

#![deny(missing_docs)]

pub mod descriptor;
pub mod digest;
pub mod errors;
pub mod manifest;
pub mod verify;

pub use descriptor::{
    ContentKey, Descriptor, ANNOTATION_REF_NAME, ANNOTATION_TITLE, ANNOTATION_UNCOMPRESSED_DIGEST,
    ANNOTATION_UNPACK,
};
pub use digest::{Algorithm, Digest, Digester, Verifier};
pub use errors::ContentError;
pub use manifest::{is_manifest, successors, ManifestKind};
pub use verify::{read_all, VerifyReader};
