//! OCI image layout output.
//!
//! Writes `oci-layout`, `index.json` and `blobs/sha256/<hex>` for a built
//! image, using exactly the bytes that would be pushed to a registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use stratum_core::error::{BuildError, Result};

use crate::digest::{canonical_json, Blob};

use super::descriptor::{Descriptor, MEDIA_TYPE_IMAGE_INDEX};
use super::index::IndexDocument;

const OCI_LAYOUT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Annotation naming an image inside a layout.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Writes content-addressed blobs into an image layout directory.
#[derive(Debug)]
pub struct LayoutWriter {
    root: PathBuf,
    blobs_dir: PathBuf,
}

impl LayoutWriter {
    /// Create the layout skeleton under `root`.
    pub fn create(root: &Path) -> Result<Self> {
        let blobs_dir = root.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir)
            .map_err(|e| BuildError::io(format!("creating {}", blobs_dir.display()), e))?;
        let layout = root.join("oci-layout");
        std::fs::write(&layout, OCI_LAYOUT)
            .map_err(|e| BuildError::io(format!("writing {}", layout.display()), e))?;
        Ok(Self {
            root: root.to_path_buf(),
            blobs_dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a blob; an already-present digest is left untouched.
    pub fn write_blob(&self, blob: &Blob) -> Result<PathBuf> {
        let path = self.blobs_dir.join(blob.digest().hex());
        if path.exists() {
            return Ok(path);
        }
        std::fs::write(&path, blob.bytes())
            .map_err(|e| BuildError::io(format!("writing blob {}", blob.digest()), e))?;
        tracing::debug!(digest = %blob.digest(), size = blob.size(), "Wrote layout blob");
        Ok(path)
    }

    /// Write `index.json` pointing at the image index descriptor.
    pub fn finish(self, image_index: &Descriptor, ref_name: Option<&str>) -> Result<PathBuf> {
        let mut entry = image_index.clone();
        if let Some(name) = ref_name {
            entry
                .annotations
                .insert(REF_NAME_ANNOTATION.to_string(), name.to_string());
        }
        let document = IndexDocument {
            schema_version: 2,
            media_type: MEDIA_TYPE_IMAGE_INDEX.to_string(),
            manifests: vec![entry],
            annotations: BTreeMap::new(),
        };
        let path = self.root.join("index.json");
        std::fs::write(&path, canonical_json(&document)?)
            .map_err(|e| BuildError::io(format!("writing {}", path.display()), e))?;
        tracing::info!(path = %self.root.display(), digest = %image_index.digest, "Wrote OCI layout");
        Ok(self.root)
    }
}
