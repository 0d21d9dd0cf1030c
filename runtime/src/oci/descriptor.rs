//! Descriptors and media types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stratum_core::Architecture;

use crate::digest::{Blob, ContentDigest};

pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Platform of a manifest inside an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn linux(arch: Architecture) -> Self {
        Platform {
            architecture: arch.oci_architecture().to_string(),
            os: "linux".to_string(),
            variant: arch.oci_variant().map(str::to_string),
        }
    }
}

/// Reference to a blob, manifest or index by digest and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: ContentDigest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: ContentDigest, size: u64) -> Self {
        Descriptor {
            media_type: media_type.into(),
            digest,
            size,
            platform: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Descriptor of an in-memory blob.
    pub fn of(media_type: impl Into<String>, blob: &Blob) -> Self {
        Self::new(media_type, blob.digest().clone(), blob.size())
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let blob = Blob::new(b"{}".to_vec());
        let desc = Descriptor::of(MEDIA_TYPE_IMAGE_MANIFEST, &blob)
            .with_platform(Platform::linux(Architecture::ArmV7));
        let value = serde_json::to_value(&desc).unwrap();
        assert_eq!(value["mediaType"], MEDIA_TYPE_IMAGE_MANIFEST);
        assert_eq!(value["digest"], blob.digest().to_string());
        assert_eq!(value["size"], 2);
        assert_eq!(value["platform"]["architecture"], "arm");
        assert_eq!(value["platform"]["variant"], "v7");
        assert!(value.get("annotations").is_none());
    }

    #[test]
    fn test_platform_without_variant() {
        let value = serde_json::to_value(Platform::linux(Architecture::Amd64)).unwrap();
        assert_eq!(value, serde_json::json!({"architecture": "amd64", "os": "linux"}));
    }
}
