//! Registry push protocol.
//!
//! `RegistryClient` is the seam between the publisher and a concrete
//! transport. Clients are injected explicitly and shared as
//! `Arc<dyn RegistryClient>`; every method must tolerate concurrent calls.
//! `Pusher` wraps a client with a per-push timeout, a retry budget for
//! transient failures and a cancellation token.

pub mod memory;
pub mod oci;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stratum_core::error::{BuildError, FailureKind, PublishStage, Result};
use stratum_core::ImageReference;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::digest::Blob;
use crate::oci::descriptor::{Descriptor, MEDIA_TYPE_IMAGE_INDEX};

pub use memory::{MemoryRegistry, RegistryEvent};
pub use oci::{OciRegistryClient, RegistryAuth, TransportOptions};

/// A single failed registry call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PushError {
    pub kind: FailureKind,
    pub message: String,
}

impl PushError {
    pub fn transient(message: impl Into<String>) -> Self {
        PushError {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        PushError {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }
}

/// Push operations against an OCI registry.
///
/// Pushing content the registry already holds must succeed without effect.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Upload a blob into the repository of `target`.
    async fn push_blob(
        &self,
        target: &ImageReference,
        media_type: &str,
        blob: &Blob,
    ) -> std::result::Result<Descriptor, PushError>;

    /// Upload a manifest under the tag or digest of `target`.
    async fn push_manifest(
        &self,
        target: &ImageReference,
        media_type: &str,
        manifest: &Blob,
    ) -> std::result::Result<Descriptor, PushError>;

    /// Upload an image index under the tag or digest of `target`.
    async fn push_index(
        &self,
        target: &ImageReference,
        index: &Blob,
    ) -> std::result::Result<Descriptor, PushError> {
        self.push_manifest(target, MEDIA_TYPE_IMAGE_INDEX, index)
            .await
    }
}

/// Time and retry budget of a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushPolicy {
    /// Upper bound for one attempt
    pub timeout: Duration,
    /// Attempts per push, including the first
    pub attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for PushPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

enum Failure {
    TimedOut,
    Rejected(PushError),
}

/// A registry client with timeout, retry and cancellation applied per push.
#[derive(Clone)]
pub struct Pusher {
    client: Arc<dyn RegistryClient>,
    policy: PushPolicy,
    cancel: CancellationToken,
}

impl Pusher {
    pub fn new(client: Arc<dyn RegistryClient>, policy: PushPolicy, cancel: CancellationToken) -> Self {
        Self {
            client,
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> &PushPolicy {
        &self.policy
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn push_blob(
        &self,
        stage: PublishStage,
        target: &ImageReference,
        media_type: &str,
        blob: &Blob,
    ) -> Result<Descriptor> {
        let label = target.with_digest(&blob.digest().to_string());
        self.run(stage, &label, || self.client.push_blob(target, media_type, blob))
            .await
    }

    pub async fn push_manifest(
        &self,
        stage: PublishStage,
        target: &ImageReference,
        media_type: &str,
        manifest: &Blob,
    ) -> Result<Descriptor> {
        self.run(stage, target, || {
            self.client.push_manifest(target, media_type, manifest)
        })
        .await
    }

    pub async fn push_index(
        &self,
        stage: PublishStage,
        target: &ImageReference,
        index: &Blob,
    ) -> Result<Descriptor> {
        self.run(stage, target, || self.client.push_index(target, index))
            .await
    }

    async fn run<T, F, Fut>(&self, stage: PublishStage, reference: &ImageReference, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, PushError>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(BuildError::Cancelled { stage: stage.to_string() });
                }
                outcome = tokio::time::timeout(self.policy.timeout, op()) => outcome,
            };

            let failure = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => Failure::Rejected(e),
                Err(_) => Failure::TimedOut,
            };

            let retryable = match &failure {
                Failure::TimedOut => true,
                Failure::Rejected(e) => e.kind == FailureKind::Transient,
            };
            if !retryable || attempt >= attempts {
                return Err(match failure {
                    Failure::TimedOut => BuildError::Timeout {
                        reference: reference.to_string(),
                        stage,
                    },
                    Failure::Rejected(e) => BuildError::RegistryFailure {
                        reference: reference.to_string(),
                        stage,
                        kind: e.kind,
                        message: e.message,
                    },
                });
            }

            let reason = match &failure {
                Failure::TimedOut => "timed out".to_string(),
                Failure::Rejected(e) => e.message.clone(),
            };
            tracing::warn!(
                reference = %reference,
                stage = %stage,
                attempt,
                attempts,
                reason = %reason,
                "Push failed, retrying"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(BuildError::Cancelled { stage: stage.to_string() });
                }
                _ = tokio::time::sleep(self.policy.backoff) => {}
            }
        }
    }
}
