//! Image config blob.
//!
//! One config per architecture. Every time field is the build timestamp.

use serde::Serialize;
use stratum_core::error::Result;
use stratum_core::{Architecture, BuildTimestamp};

use crate::digest::{Blob, ContentDigest};

use super::descriptor::{Descriptor, MEDIA_TYPE_IMAGE_CONFIG};

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageConfigDocument<'a> {
    architecture: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    variant: Option<&'a str>,
    os: &'a str,
    created: String,
    config: RuntimeConfig<'a>,
    rootfs: RootFs<'a>,
    history: Vec<History>,
}

#[derive(Serialize)]
struct RuntimeConfig<'a> {
    #[serde(rename = "Env")]
    env: Vec<&'a str>,
}

#[derive(Serialize)]
struct RootFs<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    diff_ids: Vec<String>,
}

#[derive(Serialize)]
struct History {
    created: String,
    created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

/// A serialized image config and its descriptor.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    blob: Blob,
}

impl ImageConfig {
    /// Config for an image whose layers have the given uncompressed digests.
    pub fn new(
        arch: Architecture,
        diff_ids: &[ContentDigest],
        created: &BuildTimestamp,
    ) -> Result<Self> {
        let layers: Vec<(&ContentDigest, &str)> = diff_ids.iter().map(|d| (d, "packages")).collect();
        Self::layered(arch, &layers, created)
    }

    /// Config for ordered layers, each given as its diff_id and the comment
    /// recorded in its history entry.
    pub fn layered(
        arch: Architecture,
        layers: &[(&ContentDigest, &str)],
        created: &BuildTimestamp,
    ) -> Result<Self> {
        let created = created.rfc3339();
        let document = ImageConfigDocument {
            architecture: arch.oci_architecture(),
            variant: arch.oci_variant(),
            os: "linux",
            created: created.clone(),
            config: RuntimeConfig {
                env: vec![DEFAULT_PATH],
            },
            rootfs: RootFs {
                kind: "layers",
                diff_ids: layers.iter().map(|(diff_id, _)| diff_id.to_string()).collect(),
            },
            history: layers
                .iter()
                .map(|(_, comment)| History {
                    created: created.clone(),
                    created_by: format!("stratum {}", stratum_core::VERSION),
                    comment: Some(comment.to_string()),
                })
                .collect(),
        };
        Ok(ImageConfig {
            blob: Blob::canonical_json(&document)?,
        })
    }

    pub fn blob(&self) -> &Blob {
        &self.blob
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::of(MEDIA_TYPE_IMAGE_CONFIG, &self.blob)
    }
}
