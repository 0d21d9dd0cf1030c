//! Stratum Runtime - reproducible image builds and publishing.
//!
//! This crate turns a validated build configuration into deterministic
//! layers, OCI manifests and a multi-architecture index, generates SBOMs for
//! them and pushes the whole graph to a registry in dependency order.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod build;
pub mod digest;
pub mod layer;
pub mod layering;
pub mod oci;
pub mod publish;
pub mod registry;
pub mod resolve;
pub mod sbom;
pub mod workdir;

// Re-export common types
pub use archive::{ArchiveBlob, ArchiveFormat, ArchiveOptions, ArchiveWriter, Compression, FileEntry};
pub use build::{ArchImage, BuildEngine, BuiltImage};
pub use digest::{Blob, ContentDigest};
pub use layer::{Layer, LayerBuilder};
pub use layering::LayerContents;
pub use oci::{Descriptor, ImageConfig, Index, LayoutWriter, Manifest, Platform};
pub use publish::{PublishFailure, PublishReport, PublishState, Publisher};
pub use registry::{MemoryRegistry, OciRegistryClient, PushPolicy, RegistryAuth, RegistryClient, TransportOptions};
pub use resolve::{InstalledPackage, LocalResolver, PackageResolver};
pub use sbom::{sbom_reference, sbom_tag, SbomArtifact, SbomAttacher, SbomGenerator, SpdxGenerator};
pub use workdir::WorkDir;

/// Stratum Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
