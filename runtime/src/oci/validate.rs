//! Structural validation of serialized manifests and indexes.
//!
//! Documents are parsed back with `oci-spec` to make sure what gets pushed is
//! readable by other OCI tooling.

use std::collections::BTreeSet;

use oci_spec::image::{ImageIndex, ImageManifest};
use serde::Serialize;
use stratum_core::error::{BuildError, Result};
use stratum_core::Architecture;

fn spec_string<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Some(s),
        _ => None,
    }
}

/// Check a serialized manifest parses and references at least one layer.
pub fn validate_manifest(bytes: &[u8]) -> Result<ImageManifest> {
    let manifest: ImageManifest = serde_json::from_slice(bytes)
        .map_err(|e| BuildError::Serialization(format!("invalid image manifest: {}", e)))?;
    if manifest.layers().is_empty() {
        return Err(BuildError::Serialization(
            "image manifest has no layers".to_string(),
        ));
    }
    Ok(manifest)
}

/// Check a serialized index lists exactly one manifest per expected
/// architecture, each with a matching linux platform.
pub fn validate_index(bytes: &[u8], expected: &[Architecture]) -> Result<ImageIndex> {
    let index: ImageIndex = serde_json::from_slice(bytes)
        .map_err(|e| BuildError::Serialization(format!("invalid image index: {}", e)))?;

    let mut found = BTreeSet::new();
    for descriptor in index.manifests() {
        let platform = descriptor.platform().as_ref().ok_or_else(|| {
            BuildError::Serialization(format!(
                "index entry {} has no platform",
                descriptor.digest()
            ))
        })?;
        let os = spec_string(platform.os());
        if os.as_deref() != Some("linux") {
            return Err(BuildError::Serialization(format!(
                "index entry {} has os {:?}, expected linux",
                descriptor.digest(),
                os
            )));
        }
        let name = match (spec_string(platform.architecture()), platform.variant()) {
            (Some(arch), Some(variant)) => format!("{}/{}", arch, variant),
            (Some(arch), None) => arch,
            (None, _) => {
                return Err(BuildError::Serialization(format!(
                    "index entry {} has an unreadable architecture",
                    descriptor.digest()
                )))
            }
        };
        let arch: Architecture = name.parse()?;
        if !found.insert(arch) {
            return Err(BuildError::Serialization(format!(
                "index lists {} more than once",
                arch
            )));
        }
    }

    let expected: BTreeSet<Architecture> = expected.iter().copied().collect();
    if found != expected {
        return Err(BuildError::Serialization(format!(
            "index architectures {:?} do not match requested {:?}",
            found.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
            expected.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
        )));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Blob;
    use crate::oci::descriptor::{Descriptor, MEDIA_TYPE_IMAGE_MANIFEST};
    use crate::oci::index::Index;
    use stratum_core::Annotations;

    fn index(archs: &[Architecture]) -> Index {
        Index::assemble(
            archs.iter().map(|a| {
                let blob = Blob::new(a.as_str().as_bytes().to_vec());
                (*a, Descriptor::of(MEDIA_TYPE_IMAGE_MANIFEST, &blob))
            }),
            &Annotations::none(),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_index() {
        let archs = [Architecture::Amd64, Architecture::Arm64, Architecture::ArmV7];
        let parsed = validate_index(index(&archs).blob().bytes(), &archs).unwrap();
        assert_eq!(parsed.manifests().len(), 3);
    }

    #[test]
    fn test_missing_architecture_detected() {
        let built = index(&[Architecture::Amd64]);
        let err = validate_index(
            built.blob().bytes(),
            &[Architecture::Amd64, Architecture::Arm64],
        )
        .unwrap_err();
        assert!(err.to_string().contains("do not match"));
    }

    #[test]
    fn test_duplicate_platform_detected() {
        let doc = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {"mediaType": MEDIA_TYPE_IMAGE_MANIFEST, "digest": format!("sha256:{}", "a".repeat(64)), "size": 1,
                 "platform": {"architecture": "amd64", "os": "linux"}},
                {"mediaType": MEDIA_TYPE_IMAGE_MANIFEST, "digest": format!("sha256:{}", "b".repeat(64)), "size": 1,
                 "platform": {"architecture": "amd64", "os": "linux"}}
            ]
        });
        let bytes = serde_json::to_vec(&doc).unwrap();
        let err = validate_index(&bytes, &[Architecture::Amd64]).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(validate_index(b"not json", &[Architecture::Amd64]).is_err());
        assert!(validate_manifest(b"{}").is_err());
    }
}
