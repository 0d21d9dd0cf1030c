//! Manifest assembler.
//!
//! Layers are kept in the order given (first = base). The serialized form is
//! canonical JSON, so the digest changes with any change to config, layer
//! order or annotations.

use std::collections::BTreeMap;

use serde::Serialize;
use stratum_core::error::{BuildError, Result};
use stratum_core::Annotations;

use crate::digest::{Blob, ContentDigest};

use super::descriptor::{Descriptor, Platform, MEDIA_TYPE_IMAGE_MANIFEST};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument<'a> {
    schema_version: u32,
    media_type: &'a str,
    config: &'a Descriptor,
    layers: &'a [Descriptor],
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    annotations: &'a BTreeMap<String, String>,
}

/// A single-architecture image manifest with its serialized bytes.
#[derive(Debug, Clone)]
pub struct Manifest {
    config: Descriptor,
    layers: Vec<Descriptor>,
    blob: Blob,
}

impl Manifest {
    /// Assemble a manifest from a config and ordered layers.
    pub fn assemble(
        config: Descriptor,
        layers: Vec<Descriptor>,
        annotations: &Annotations,
    ) -> Result<Self> {
        if layers.is_empty() {
            return Err(BuildError::ConfigurationError(
                "a manifest needs at least one layer".to_string(),
            ));
        }
        let document = ManifestDocument {
            schema_version: 2,
            media_type: MEDIA_TYPE_IMAGE_MANIFEST,
            config: &config,
            layers: &layers,
            annotations: annotations.as_map(),
        };
        let blob = Blob::canonical_json(&document)?;
        Ok(Manifest {
            config,
            layers,
            blob,
        })
    }

    pub fn config(&self) -> &Descriptor {
        &self.config
    }

    pub fn layers(&self) -> &[Descriptor] {
        &self.layers
    }

    pub fn blob(&self) -> &Blob {
        &self.blob
    }

    pub fn digest(&self) -> &ContentDigest {
        self.blob.digest()
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::of(MEDIA_TYPE_IMAGE_MANIFEST, &self.blob)
    }

    /// Descriptor as listed in an index.
    pub fn platform_descriptor(&self, platform: Platform) -> Descriptor {
        self.descriptor().with_platform(platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::descriptor::{MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_LAYER_GZIP};
    use stratum_core::{Architecture, BuildTimestamp};

    fn layer(content: &[u8]) -> Descriptor {
        Descriptor::of(MEDIA_TYPE_LAYER_GZIP, &Blob::new(content.to_vec()))
    }

    fn config() -> Descriptor {
        Descriptor::of(MEDIA_TYPE_IMAGE_CONFIG, &Blob::new(b"{}".to_vec()))
    }

    #[test]
    fn test_layer_order_is_preserved() {
        let m = Manifest::assemble(config(), vec![layer(b"base"), layer(b"top")], &Annotations::none())
            .unwrap();
        assert_eq!(m.layers()[0], layer(b"base"));
        assert_eq!(m.layers()[1], layer(b"top"));

        let value: serde_json::Value = serde_json::from_slice(m.blob().bytes()).unwrap();
        assert_eq!(value["schemaVersion"], 2);
        assert_eq!(value["mediaType"], MEDIA_TYPE_IMAGE_MANIFEST);
        assert_eq!(value["layers"][0]["digest"], layer(b"base").digest.to_string());
    }

    #[test]
    fn test_layer_permutation_changes_digest() {
        let a = Manifest::assemble(config(), vec![layer(b"base"), layer(b"top")], &Annotations::none())
            .unwrap();
        let b = Manifest::assemble(config(), vec![layer(b"top"), layer(b"base")], &Annotations::none())
            .unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_annotations_change_digest() {
        let plain = Manifest::assemble(config(), vec![layer(b"base")], &Annotations::none()).unwrap();
        let annotations = Annotations::declare(
            vec![("foo".to_string(), "bar".to_string())],
            &BuildTimestamp::epoch(),
        )
        .unwrap();
        let annotated = Manifest::assemble(config(), vec![layer(b"base")], &annotations).unwrap();
        assert_ne!(plain.digest(), annotated.digest());

        let value: serde_json::Value = serde_json::from_slice(annotated.blob().bytes()).unwrap();
        assert_eq!(value["annotations"]["foo"], "bar");
    }

    #[test]
    fn test_assemble_is_idempotent() {
        let a = Manifest::assemble(config(), vec![layer(b"base")], &Annotations::none()).unwrap();
        let b = Manifest::assemble(config(), vec![layer(b"base")], &Annotations::none()).unwrap();
        assert_eq!(a.blob().bytes(), b.blob().bytes());
    }

    #[test]
    fn test_no_layers_rejected() {
        let err = Manifest::assemble(config(), vec![], &Annotations::none()).unwrap_err();
        assert!(matches!(err, BuildError::ConfigurationError(_)));
    }

    #[test]
    fn test_parses_as_oci_manifest() {
        let m = Manifest::assemble(config(), vec![layer(b"base")], &Annotations::none()).unwrap();
        let parsed: oci_spec::image::ImageManifest = serde_json::from_slice(m.blob().bytes()).unwrap();
        assert_eq!(parsed.layers().len(), 1);
        let desc = m.platform_descriptor(Platform::linux(Architecture::Amd64));
        assert_eq!(desc.digest, *m.digest());
        assert!(desc.platform.is_some());
    }
}
