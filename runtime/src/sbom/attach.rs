//! SBOM attachment.
//!
//! An SBOM is published as a single-layer image in the subject's repository,
//! tagged `sha256-<hex>.sbom` after the subject digest. The subject itself
//! carries no pointer to its SBOM; the tag is the only link.

use serde_json::json;
use stratum_core::error::{PublishStage, Result};
use stratum_core::{Annotations, ImageReference};

use crate::digest::{Blob, ContentDigest};
use crate::oci::descriptor::{MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_MANIFEST};
use crate::oci::manifest::Manifest;
use crate::registry::Pusher;

use super::SbomArtifact;

const SBOM_TAG_SUFFIX: &str = ".sbom";

/// Tag under which the SBOM of `subject` is published.
///
/// `sha256:abcd…` becomes `sha256-abcd….sbom`.
pub fn sbom_tag(subject: &ContentDigest) -> String {
    format!("{}-{}{}", subject.algorithm(), subject.hex(), SBOM_TAG_SUFFIX)
}

/// Reference of the SBOM of `subject` inside `repository`.
pub fn sbom_reference(repository: &ImageReference, subject: &ContentDigest) -> ImageReference {
    repository.with_tag(&sbom_tag(subject))
}

/// Publishes SBOM artifacts next to their subjects.
#[derive(Clone)]
pub struct SbomAttacher {
    pusher: Pusher,
}

impl SbomAttacher {
    pub fn new(pusher: Pusher) -> Self {
        Self { pusher }
    }

    /// Push `artifact` into `repository` and return the reference it was
    /// tagged with.
    pub async fn attach(
        &self,
        repository: &ImageReference,
        artifact: &SbomArtifact,
    ) -> Result<ImageReference> {
        let target = sbom_reference(repository, artifact.subject_digest());
        let stage = PublishStage::Sboms;

        let content = artifact.content();
        let layer = self
            .pusher
            .push_blob(stage, &target, artifact.format().media_type(), content)
            .await?;

        let config = sbom_config(content)?;
        let config_desc = self
            .pusher
            .push_blob(stage, &target, MEDIA_TYPE_IMAGE_CONFIG, &config)
            .await?;

        let manifest = Manifest::assemble(config_desc, vec![layer], &Annotations::none())?;
        self.pusher
            .push_manifest(stage, &target, MEDIA_TYPE_IMAGE_MANIFEST, manifest.blob())
            .await?;

        tracing::info!(
            reference = %target,
            subject = %artifact.subject_digest(),
            format = %artifact.format(),
            "Attached SBOM"
        );
        Ok(target)
    }
}

fn sbom_config(content: &Blob) -> Result<Blob> {
    Blob::canonical_json(&json!({
        "architecture": "",
        "os": "",
        "config": {},
        "rootfs": {
            "type": "layers",
            "diff_ids": [content.digest().to_string()],
        },
    }))
}
