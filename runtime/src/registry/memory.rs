//! In-memory registry.
//!
//! Stores pushed content per repository, records every call in order, and
//! enforces that manifests only reference blobs and indexes only reference
//! manifests that are already present. Specific references can be made to
//! fail, permanently or a fixed number of times, or to respond slowly.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stratum_core::ImageReference;

use crate::digest::{Blob, ContentDigest};
use crate::oci::descriptor::{Descriptor, MEDIA_TYPE_IMAGE_INDEX};

use super::{PushError, RegistryClient};

/// One successful push, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Blob {
        repository: String,
        digest: ContentDigest,
        existed: bool,
    },
    Manifest {
        reference: String,
        media_type: String,
        digest: ContentDigest,
    },
}

#[derive(Default)]
struct Repository {
    blobs: HashSet<ContentDigest>,
    manifests: HashMap<ContentDigest, (String, Blob)>,
    tags: HashMap<String, ContentDigest>,
}

#[derive(Default)]
struct State {
    repositories: HashMap<String, Repository>,
    events: Vec<RegistryEvent>,
    fail_always: Vec<String>,
    fail_transient: Vec<(String, u32)>,
    delays: Vec<(String, Duration)>,
    attempts: HashMap<String, u32>,
}

/// A registry held entirely in memory.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reject every push whose reference contains `pattern`.
    pub fn fail_reference(&self, pattern: &str) {
        self.state.lock().fail_always.push(pattern.to_string());
    }

    /// Fail the next `times` pushes whose reference contains `pattern` with a
    /// transient error.
    pub fn fail_transiently(&self, pattern: &str, times: u32) {
        self.state
            .lock()
            .fail_transient
            .push((pattern.to_string(), times));
    }

    /// Delay every push whose reference contains `pattern` by `latency`,
    /// on top of any latency set with `with_latency`.
    pub fn delay_reference(&self, pattern: &str, latency: Duration) {
        self.state
            .lock()
            .delays
            .push((pattern.to_string(), latency));
    }

    /// Number of calls whose reference contained `pattern`.
    pub fn attempts(&self, pattern: &str) -> u32 {
        self.state
            .lock()
            .attempts
            .iter()
            .filter(|(reference, _)| reference.contains(pattern))
            .map(|(_, n)| *n)
            .sum()
    }

    /// Successful pushes in call order.
    pub fn events(&self) -> Vec<RegistryEvent> {
        self.state.lock().events.clone()
    }

    pub fn has_blob(&self, repository: &ImageReference, digest: &ContentDigest) -> bool {
        self.state
            .lock()
            .repositories
            .get(&repository.repository_path())
            .map_or(false, |r| r.blobs.contains(digest))
    }

    /// Manifest stored under the tag or digest of `reference`.
    pub fn manifest(&self, reference: &ImageReference) -> Option<Blob> {
        let state = self.state.lock();
        let repo = state.repositories.get(&reference.repository_path())?;
        let digest = match (&reference.digest, &reference.tag) {
            (Some(d), _) => ContentDigest::parse(d).ok()?,
            (None, Some(tag)) => repo.tags.get(tag)?.clone(),
            (None, None) => return None,
        };
        repo.manifests.get(&digest).map(|(_, blob)| blob.clone())
    }

    /// Tags present in the repository of `reference`, sorted.
    pub fn tags(&self, reference: &ImageReference) -> Vec<String> {
        let state = self.state.lock();
        let mut tags: Vec<String> = state
            .repositories
            .get(&reference.repository_path())
            .map(|r| r.tags.keys().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }

    async fn delay(&self, key: &str) {
        let extra: Duration = self
            .state
            .lock()
            .delays
            .iter()
            .filter(|(pattern, _)| key.contains(pattern.as_str()))
            .map(|(_, latency)| *latency)
            .sum();
        let latency = self.latency.unwrap_or_default() + extra;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_failures(state: &mut State, key: &str) -> Result<(), PushError> {
        *state.attempts.entry(key.to_string()).or_insert(0) += 1;
        if state.fail_always.iter().any(|p| key.contains(p.as_str())) {
            return Err(PushError::permanent(format!("DENIED: push to {} rejected", key)));
        }
        if let Some((_, remaining)) = state
            .fail_transient
            .iter_mut()
            .find(|(p, remaining)| *remaining > 0 && key.contains(p.as_str()))
        {
            *remaining -= 1;
            return Err(PushError::transient(format!("503 Service Unavailable: {}", key)));
        }
        Ok(())
    }
}

fn referenced_digests(body: &[u8], index: bool) -> Result<Vec<ContentDigest>, PushError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| PushError::permanent(format!("MANIFEST_INVALID: {}", e)))?;
    let mut digests = Vec::new();
    let mut collect = |desc: &serde_json::Value| -> Result<(), PushError> {
        let digest = desc["digest"]
            .as_str()
            .ok_or_else(|| PushError::permanent("MANIFEST_INVALID: descriptor without digest"))?;
        digests.push(
            ContentDigest::parse(digest)
                .map_err(|e| PushError::permanent(format!("DIGEST_INVALID: {}", e)))?,
        );
        Ok(())
    };
    if index {
        for desc in value["manifests"].as_array().into_iter().flatten() {
            collect(desc)?;
        }
    } else {
        collect(&value["config"])?;
        for desc in value["layers"].as_array().into_iter().flatten() {
            collect(desc)?;
        }
    }
    Ok(digests)
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn push_blob(
        &self,
        target: &ImageReference,
        media_type: &str,
        blob: &Blob,
    ) -> Result<Descriptor, PushError> {
        let key = target.with_digest(&blob.digest().to_string()).to_string();
        self.delay(&key).await;
        let mut state = self.state.lock();
        Self::check_failures(&mut state, &key)?;

        let repo = state
            .repositories
            .entry(target.repository_path())
            .or_default();
        let existed = !repo.blobs.insert(blob.digest().clone());
        state.events.push(RegistryEvent::Blob {
            repository: target.repository_path(),
            digest: blob.digest().clone(),
            existed,
        });
        Ok(Descriptor::of(media_type, blob))
    }

    async fn push_manifest(
        &self,
        target: &ImageReference,
        media_type: &str,
        manifest: &Blob,
    ) -> Result<Descriptor, PushError> {
        let key = target.to_string();
        self.delay(&key).await;
        let mut state = self.state.lock();
        Self::check_failures(&mut state, &key)?;

        if let Some(ref digest) = target.digest {
            if *digest != manifest.digest().to_string() {
                return Err(PushError::permanent(format!(
                    "DIGEST_INVALID: pushed {} as {}",
                    manifest.digest(),
                    digest
                )));
            }
        }

        let is_index = media_type == MEDIA_TYPE_IMAGE_INDEX;
        let referenced = referenced_digests(manifest.bytes(), is_index)?;
        let repo = state
            .repositories
            .entry(target.repository_path())
            .or_default();
        for digest in &referenced {
            let present = if is_index {
                repo.manifests.contains_key(digest)
            } else {
                repo.blobs.contains(digest)
            };
            if !present {
                return Err(PushError::permanent(format!(
                    "{}: {} references missing {}",
                    if is_index { "MANIFEST_UNKNOWN" } else { "MANIFEST_BLOB_UNKNOWN" },
                    key,
                    digest
                )));
            }
        }

        repo.manifests.insert(
            manifest.digest().clone(),
            (media_type.to_string(), manifest.clone()),
        );
        if let Some(ref tag) = target.tag {
            repo.tags.insert(tag.clone(), manifest.digest().clone());
        }
        state.events.push(RegistryEvent::Manifest {
            reference: key,
            media_type: media_type.to_string(),
            digest: manifest.digest().clone(),
        });
        Ok(Descriptor::of(media_type, manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::descriptor::MEDIA_TYPE_IMAGE_MANIFEST;

    fn repo() -> ImageReference {
        ImageReference::parse("registry.test/org/base:latest").unwrap()
    }

    #[tokio::test]
    async fn test_blob_push_is_idempotent() {
        let registry = MemoryRegistry::new();
        let blob = Blob::new(b"layer".to_vec());
        registry.push_blob(&repo(), "x", &blob).await.unwrap();
        registry.push_blob(&repo(), "x", &blob).await.unwrap();

        let events = registry.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RegistryEvent::Blob { existed: false, .. }));
        assert!(matches!(events[1], RegistryEvent::Blob { existed: true, .. }));
        assert!(registry.has_blob(&repo(), blob.digest()));
    }

    #[tokio::test]
    async fn test_manifest_requires_blobs() {
        let registry = MemoryRegistry::new();
        let config = Blob::new(b"{}".to_vec());
        let layer = Blob::new(b"layer".to_vec());
        let manifest = Blob::new(
            serde_json::to_vec(&serde_json::json!({
                "schemaVersion": 2,
                "config": {"mediaType": "c", "digest": config.digest().to_string(), "size": 2},
                "layers": [{"mediaType": "l", "digest": layer.digest().to_string(), "size": 5}]
            }))
            .unwrap(),
        );

        let err = registry
            .push_manifest(&repo(), MEDIA_TYPE_IMAGE_MANIFEST, &manifest)
            .await
            .unwrap_err();
        assert!(err.message.contains("MANIFEST_BLOB_UNKNOWN"));

        registry.push_blob(&repo(), "c", &config).await.unwrap();
        registry.push_blob(&repo(), "l", &layer).await.unwrap();
        registry
            .push_manifest(&repo(), MEDIA_TYPE_IMAGE_MANIFEST, &manifest)
            .await
            .unwrap();
        assert_eq!(registry.manifest(&repo()), Some(manifest.clone()));
        assert_eq!(
            registry.manifest(&repo().with_digest(&manifest.digest().to_string())),
            Some(manifest)
        );
        assert_eq!(registry.tags(&repo()), vec!["latest".to_string()]);
    }

    #[tokio::test]
    async fn test_digest_target_must_match() {
        let registry = MemoryRegistry::new();
        let index = Blob::new(br#"{"manifests":[]}"#.to_vec());
        let wrong = repo().with_digest(&ContentDigest::of(b"other").to_string());
        let err = registry.push_index(&wrong, &index).await.unwrap_err();
        assert!(err.message.contains("DIGEST_INVALID"));
    }

    #[tokio::test]
    async fn test_delayed_reference() {
        let registry = MemoryRegistry::new();
        registry.delay_reference("slow", Duration::from_millis(200));
        let index = Blob::new(br#"{"manifests":[]}"#.to_vec());
        let slow = ImageReference::parse("registry.test/org/base:slow").unwrap();

        let fast = tokio::time::timeout(Duration::from_millis(100), registry.push_index(&repo(), &index)).await;
        assert!(fast.is_ok());
        let delayed = tokio::time::timeout(Duration::from_millis(100), registry.push_index(&slow, &index)).await;
        assert!(delayed.is_err());
        assert!(registry.tags(&slow).iter().all(|t| t != "slow"));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let registry = MemoryRegistry::new();
        registry.fail_transiently("latest", 1);
        let index = Blob::new(br#"{"manifests":[]}"#.to_vec());

        let err = registry.push_index(&repo(), &index).await.unwrap_err();
        assert_eq!(err.kind, stratum_core::FailureKind::Transient);
        registry.push_index(&repo(), &index).await.unwrap();
        assert_eq!(registry.attempts("latest"), 2);
    }
}
