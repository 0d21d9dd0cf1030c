//! Publisher.
//!
//! Pushes a built image in dependency order, one level at a time:
//! blobs, then manifests, then the index, then SBOM artifacts. Pushes inside
//! a level run concurrently. Nothing is rolled back on failure; every push is
//! idempotent, so re-running the whole publish converges.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use stratum_core::error::{BuildError, PublishStage, Result};
use stratum_core::ImageReference;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::build::BuiltImage;
use crate::digest::Blob;
use crate::oci::descriptor::{MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_MANIFEST};
use crate::registry::{PushPolicy, Pusher, RegistryClient};
use crate::sbom::{sbom_reference, SbomAttacher};

/// Progress of a publish run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishState {
    Pending,
    LayersPushed,
    ManifestsPushed,
    IndexPushed,
    SbomsPushed,
    Done,
    Failed(String),
}

impl fmt::Display for PublishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishState::Pending => write!(f, "pending"),
            PublishState::LayersPushed => write!(f, "layers-pushed"),
            PublishState::ManifestsPushed => write!(f, "manifests-pushed"),
            PublishState::IndexPushed => write!(f, "index-pushed"),
            PublishState::SbomsPushed => write!(f, "sboms-pushed"),
            PublishState::Done => write!(f, "done"),
            PublishState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Records state transitions of one run.
#[derive(Debug)]
struct Progress {
    history: Vec<PublishState>,
}

impl Progress {
    fn new() -> Self {
        Self {
            history: vec![PublishState::Pending],
        }
    }

    fn advance(&mut self, state: PublishState) {
        tracing::debug!(state = %state, "Publish state changed");
        self.history.push(state);
    }

    /// Move to `Failed` if `result` is an error, handing the history over
    /// to the failure.
    fn check<T>(&mut self, result: Result<T>) -> std::result::Result<T, PublishFailure> {
        result.map_err(|error| {
            tracing::warn!(error = %error, "Publish failed");
            self.advance(PublishState::Failed(error.to_string()));
            PublishFailure {
                error,
                states: std::mem::take(&mut self.history),
            }
        })
    }
}

/// A publish run that stopped before its image graph was complete.
///
/// Content pushed before the failure stays in the registry; publishing the
/// same image again resumes from there.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct PublishFailure {
    error: BuildError,
    states: Vec<PublishState>,
}

impl PublishFailure {
    pub fn error(&self) -> &BuildError {
        &self.error
    }

    /// Every state the run passed through, ending in `Failed`.
    pub fn states(&self) -> &[PublishState] {
        &self.states
    }

    /// The last state reached before the failure.
    pub fn reached(&self) -> &PublishState {
        self.states
            .iter()
            .rev()
            .find(|state| !matches!(state, PublishState::Failed(_)))
            .unwrap_or(&PublishState::Pending)
    }

    pub fn into_error(self) -> BuildError {
        self.error
    }
}

impl From<PublishFailure> for BuildError {
    fn from(failure: PublishFailure) -> Self {
        failure.error
    }
}

/// Outcome of a publish run whose image graph was pushed.
#[derive(Debug, Clone)]
pub struct PublishReport {
    index_reference: ImageReference,
    tags: Vec<ImageReference>,
    states: Vec<PublishState>,
    sbom_references: Vec<ImageReference>,
    failed: Vec<String>,
}

impl PublishReport {
    /// The index, pinned by digest.
    pub fn index_reference(&self) -> &ImageReference {
        &self.index_reference
    }

    pub fn tags(&self) -> &[ImageReference] {
        &self.tags
    }

    /// Every state the run passed through, in order.
    pub fn states(&self) -> &[PublishState] {
        &self.states
    }

    pub fn final_state(&self) -> &PublishState {
        self.states.last().unwrap_or(&PublishState::Pending)
    }

    /// References of successfully attached SBOMs.
    pub fn sbom_references(&self) -> &[ImageReference] {
        &self.sbom_references
    }

    /// References of SBOMs that could not be attached.
    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    /// `PartialFailure` when any SBOM attachment failed.
    pub fn into_result(self) -> Result<Self> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(BuildError::PartialFailure {
                failed: self.failed,
            })
        }
    }
}

/// Publishes built images through a registry client.
pub struct Publisher {
    pusher: Pusher,
    attacher: SbomAttacher,
}

impl Publisher {
    pub fn new(
        client: Arc<dyn RegistryClient>,
        policy: PushPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let pusher = Pusher::new(client, policy, cancel);
        Self {
            attacher: SbomAttacher::new(pusher.clone()),
            pusher,
        }
    }

    /// Push `image` and tag its index with every reference in `tags`.
    pub async fn publish(
        &self,
        image: &BuiltImage,
        tags: &[ImageReference],
    ) -> std::result::Result<PublishReport, PublishFailure> {
        let mut progress = Progress::new();
        let repository = progress.check(tags.first().ok_or_else(|| {
            BuildError::ConfigurationError("publishing needs at least one tag".to_string())
        }))?;

        let pushed = self.push_blobs(image, repository).await;
        progress.check(pushed)?;
        progress.advance(PublishState::LayersPushed);

        let pushed = self.push_manifests(image, repository).await;
        progress.check(pushed)?;
        progress.advance(PublishState::ManifestsPushed);

        let pushed = self.push_index(image, tags).await;
        progress.check(pushed)?;
        progress.advance(PublishState::IndexPushed);
        let index_reference = repository.with_digest(&image.index().digest().to_string());
        tracing::info!(reference = %index_reference, tags = tags.len(), "Pushed index");

        let attached = self.attach_sboms(image, repository).await;
        let (sbom_references, failed) = progress.check(attached)?;
        progress.advance(PublishState::SbomsPushed);
        progress.advance(PublishState::Done);

        Ok(PublishReport {
            index_reference,
            tags: tags.to_vec(),
            states: progress.history,
            sbom_references,
            failed,
        })
    }

    async fn push_blobs(&self, image: &BuiltImage, repository: &ImageReference) -> Result<()> {
        let blobs = unique_blobs(image);
        try_join_all(blobs.iter().map(|(media_type, blob)| {
            self.pusher
                .push_blob(PublishStage::Layers, repository, media_type, blob)
        }))
        .await?;
        tracing::info!(blobs = blobs.len(), "Pushed blobs");
        Ok(())
    }

    async fn push_manifests(&self, image: &BuiltImage, repository: &ImageReference) -> Result<()> {
        try_join_all(image.archs().iter().map(|arch| async move {
            let manifest = arch.manifest();
            let target = repository.with_digest(&manifest.digest().to_string());
            self.pusher
                .push_manifest(
                    PublishStage::Manifests,
                    &target,
                    MEDIA_TYPE_IMAGE_MANIFEST,
                    manifest.blob(),
                )
                .await?;
            tracing::info!(arch = %arch.architecture(), reference = %target, "Pushed manifest");
            Ok::<_, BuildError>(())
        }))
        .await?;
        Ok(())
    }

    async fn push_index(&self, image: &BuiltImage, tags: &[ImageReference]) -> Result<()> {
        try_join_all(
            tags.iter()
                .map(|tag| self.pusher.push_index(PublishStage::Index, tag, image.index().blob())),
        )
        .await?;
        Ok(())
    }

    /// Attach every SBOM. Failures are collected rather than returned,
    /// except cancellation, which aborts the run.
    async fn attach_sboms(
        &self,
        image: &BuiltImage,
        repository: &ImageReference,
    ) -> Result<(Vec<ImageReference>, Vec<String>)> {
        let outcomes = join_all(
            image
                .sboms()
                .iter()
                .map(|artifact| self.attacher.attach(repository, artifact)),
        )
        .await;

        let mut attached = Vec::new();
        let mut failed = Vec::new();
        for (artifact, outcome) in image.sboms().iter().zip(outcomes) {
            match outcome {
                Ok(reference) => attached.push(reference),
                Err(e @ BuildError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    let reference = sbom_reference(repository, artifact.subject_digest());
                    tracing::warn!(
                        subject = artifact.subject_name(),
                        reference = %reference,
                        error = %e,
                        "SBOM attachment failed"
                    );
                    failed.push(reference.to_string());
                }
            }
        }
        Ok((attached, failed))
    }
}

/// Layer and config blobs of every architecture, each digest once.
fn unique_blobs(image: &BuiltImage) -> Vec<(&'static str, Blob)> {
    let mut seen = HashSet::new();
    let mut blobs = Vec::new();
    for arch in image.archs() {
        for layer in arch.layers() {
            if seen.insert(layer.blob().digest().clone()) {
                blobs.push((layer.media_type(), layer.blob().clone()));
            }
        }
        let config = arch.config();
        if seen.insert(config.blob().digest().clone()) {
            blobs.push((MEDIA_TYPE_IMAGE_CONFIG, config.blob().clone()));
        }
    }
    blobs
}
