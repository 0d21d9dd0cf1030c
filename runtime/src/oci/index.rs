//! Index assembler.
//!
//! Aggregates per-architecture manifests into one image index. Entries are
//! sorted by architecture name before serialization, so the index digest does
//! not depend on the order architectures finished building in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stratum_core::error::{BuildError, Result};
use stratum_core::{Annotations, Architecture};

use crate::digest::{Blob, ContentDigest};

use super::descriptor::{Descriptor, Platform, MEDIA_TYPE_IMAGE_INDEX};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IndexDocument {
    pub(crate) schema_version: u32,
    pub(crate) media_type: String,
    pub(crate) manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) annotations: BTreeMap<String, String>,
}

/// A multi-architecture image index with its serialized bytes.
#[derive(Debug, Clone)]
pub struct Index {
    entries: Vec<(Architecture, Descriptor)>,
    blob: Blob,
}

impl Index {
    /// Assemble an index from manifest descriptors in any order.
    ///
    /// Each descriptor's platform is set from its architecture.
    pub fn assemble(
        manifests: impl IntoIterator<Item = (Architecture, Descriptor)>,
        annotations: &Annotations,
    ) -> Result<Self> {
        let mut entries: Vec<(Architecture, Descriptor)> = manifests
            .into_iter()
            .map(|(arch, desc)| (arch, desc.with_platform(Platform::linux(arch))))
            .collect();
        if entries.is_empty() {
            return Err(BuildError::ConfigurationError(
                "an index needs at least one manifest".to_string(),
            ));
        }

        entries.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(pair) = entries.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(BuildError::ConfigurationError(format!(
                "duplicate architecture in index: {}",
                pair[0].0
            )));
        }

        let document = IndexDocument {
            schema_version: 2,
            media_type: MEDIA_TYPE_IMAGE_INDEX.to_string(),
            manifests: entries.iter().map(|(_, d)| d.clone()).collect(),
            annotations: annotations.as_map().clone(),
        };
        let blob = Blob::canonical_json(&document)?;
        Ok(Index { entries, blob })
    }

    /// Architectures in index order.
    pub fn architectures(&self) -> impl Iterator<Item = Architecture> + '_ {
        self.entries.iter().map(|(arch, _)| *arch)
    }

    pub fn manifests(&self) -> impl Iterator<Item = &Descriptor> {
        self.entries.iter().map(|(_, d)| d)
    }

    pub fn blob(&self) -> &Blob {
        &self.blob
    }

    pub fn digest(&self) -> &ContentDigest {
        self.blob.digest()
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::of(MEDIA_TYPE_IMAGE_INDEX, &self.blob)
    }
}
