//! End-to-end build and publish against the in-memory registry.
//!
//! Each test builds a two-architecture image (amd64, arm64) with two packages
//! from a local directory repository, then publishes it and inspects what the
//! registry recorded.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stratum_core::{BuildConfig, BuildError, ImageConfiguration, ImageReference, PublishStage};
use stratum_runtime::oci::MEDIA_TYPE_IMAGE_INDEX;
use stratum_runtime::registry::RegistryEvent;
use stratum_runtime::{
    sbom_tag, BuildEngine, BuiltImage, LocalResolver, MemoryRegistry, PublishState, Publisher,
    PushPolicy,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TAG: &str = "registry.test/stratum/base:v1";

fn repository() -> TempDir {
    let repo = TempDir::new().unwrap();
    for arch in ["x86_64", "aarch64"] {
        for (name, version) in [("busybox", "1.36.1-r0"), ("ca-certificates", "20230506-r0")] {
            let dir = repo.path().join(arch).join(name);
            fs::create_dir_all(dir.join("usr/share").join(name)).unwrap();
            fs::write(
                dir.join("usr/share").join(name).join("README"),
                format!("{} built for {}\n", name, arch),
            )
            .unwrap();
            fs::write(dir.join(".PKGINFO"), format!("pkgname = {}\npkgver = {}\n", name, version))
                .unwrap();
        }
    }
    repo
}

fn config(repo: &Path, build_date: &str) -> BuildConfig {
    config_with(repo, build_date, "")
}

/// Configuration with `extra` appended to the YAML document.
fn config_with(repo: &Path, build_date: &str, extra: &str) -> BuildConfig {
    let yaml = format!(
        r#"
contents:
  repositories:
    - {}
  packages:
    - busybox
    - ca-certificates
archs:
  - amd64
  - arm64
annotations:
  org.opencontainers.image.title: base
{}"#,
        repo.display(),
        extra
    );
    BuildConfig::builder(ImageConfiguration::from_yaml(&yaml).unwrap())
        .build_date(build_date)
        .tags([TAG])
        .build()
        .unwrap()
}

async fn build(repo: &Path, build_date: &str) -> BuiltImage {
    BuildEngine::new(config(repo, build_date), Arc::new(LocalResolver::new()))
        .build()
        .await
        .unwrap()
}

fn fast_policy() -> PushPolicy {
    PushPolicy {
        timeout: Duration::from_secs(5),
        attempts: 2,
        backoff: Duration::from_millis(1),
    }
}

fn publisher(registry: &Arc<MemoryRegistry>) -> Publisher {
    Publisher::new(registry.clone(), fast_policy(), CancellationToken::new())
}

fn tags() -> Vec<ImageReference> {
    vec![ImageReference::parse(TAG).unwrap()]
}

fn manifest_position(events: &[RegistryEvent], pattern: &str) -> usize {
    events
        .iter()
        .position(|e| matches!(e, RegistryEvent::Manifest { reference, .. } if reference.contains(pattern)))
        .unwrap_or_else(|| panic!("no manifest push matching {}", pattern))
}

#[tokio::test]
async fn test_two_arch_build_publishes_full_graph() {
    let repo = repository();
    let image = build(repo.path(), "2023-01-01T00:00:00Z").await;
    assert_eq!(image.archs().len(), 2);
    assert_eq!(image.sboms().len(), 3);

    let registry = Arc::new(MemoryRegistry::new());
    let report = publisher(&registry)
        .publish(&image, &tags())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(
        report.states(),
        &[
            PublishState::Pending,
            PublishState::LayersPushed,
            PublishState::ManifestsPushed,
            PublishState::IndexPushed,
            PublishState::SbomsPushed,
            PublishState::Done,
        ]
    );
    assert_eq!(
        report.index_reference().digest.as_deref(),
        Some(image.index().digest().to_string().as_str())
    );
    assert_eq!(report.sbom_references().len(), 3);

    let manifests: Vec<_> = registry
        .events()
        .into_iter()
        .filter_map(|e| match e {
            RegistryEvent::Manifest { media_type, .. } => Some(media_type),
            _ => None,
        })
        .collect();
    // two image manifests, one index, three SBOM images
    assert_eq!(manifests.len(), 6);
    assert_eq!(manifests.iter().filter(|m| *m == MEDIA_TYPE_IMAGE_INDEX).count(), 1);

    let repo_ref = &tags()[0];
    let stored = registry.manifest(repo_ref).unwrap();
    assert_eq!(stored.bytes(), image.index().blob().bytes());

    let expected_tags: Vec<String> = {
        let mut t = vec!["v1".to_string(), sbom_tag(image.index().digest())];
        t.extend(image.archs().iter().map(|a| sbom_tag(a.manifest().digest())));
        t.sort();
        t
    };
    assert_eq!(registry.tags(repo_ref), expected_tags);
}

#[tokio::test]
async fn test_same_timestamp_same_index_digest() {
    let repo = repository();
    let first = build(repo.path(), "2023-01-01T00:00:00Z").await;
    let second = build(repo.path(), "2023-01-01T00:00:00Z").await;
    assert_eq!(first.index().digest(), second.index().digest());
    for (a, b) in first.archs().iter().zip(second.archs()) {
        assert_eq!(a.layers().len(), b.layers().len());
        for (la, lb) in a.layers().iter().zip(b.layers()) {
            assert_eq!(la.blob().bytes(), lb.blob().bytes());
        }
        assert_eq!(a.manifest().digest(), b.manifest().digest());
    }

    let later = build(repo.path(), "2024-01-01T00:00:00Z").await;
    assert_ne!(first.index().digest(), later.index().digest());
}

#[tokio::test]
async fn test_pushes_follow_dependency_order() {
    let repo = repository();
    let image = build(repo.path(), "0").await;
    let registry = Arc::new(MemoryRegistry::new());
    publisher(&registry).publish(&image, &tags()).await.unwrap();
    let events = registry.events();

    let blob_position = |digest: &stratum_runtime::ContentDigest| {
        events
            .iter()
            .position(|e| matches!(e, RegistryEvent::Blob { digest: d, .. } if d == digest))
            .unwrap()
    };

    let index_at = manifest_position(&events, ":v1");
    for arch in image.archs() {
        let manifest_digest = arch.manifest().digest().to_string();
        let manifest_at = manifest_position(&events, &manifest_digest);
        for layer in arch.layers() {
            assert!(blob_position(layer.blob().digest()) < manifest_at);
        }
        assert!(blob_position(arch.config().blob().digest()) < manifest_at);
        assert!(manifest_at < index_at);

        let sbom_at = manifest_position(&events, &sbom_tag(arch.manifest().digest()));
        assert!(manifest_at < sbom_at);
    }
    assert!(index_at < manifest_position(&events, &sbom_tag(image.index().digest())));
}

#[tokio::test]
async fn test_failed_sbom_is_isolated() {
    let repo = repository();
    let image = build(repo.path(), "0").await;
    let arm64 = image
        .archs()
        .iter()
        .find(|a| a.architecture() == stratum_core::Architecture::Arm64)
        .unwrap();
    let failing = sbom_tag(arm64.manifest().digest());

    let registry = Arc::new(MemoryRegistry::new());
    registry.fail_reference(&failing);
    let report = publisher(&registry).publish(&image, &tags()).await.unwrap();

    assert_eq!(report.final_state(), &PublishState::Done);
    assert_eq!(report.sbom_references().len(), 2);
    assert_eq!(report.failed().len(), 1);
    assert!(report.failed()[0].ends_with(&failing));
    assert!(registry.manifest(&tags()[0]).is_some());

    match report.into_result() {
        Err(BuildError::PartialFailure { failed }) => {
            assert_eq!(failed.len(), 1);
            assert!(failed[0].contains(&failing));
        }
        other => panic!("expected partial failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_republish_is_idempotent() {
    let repo = repository();
    let image = build(repo.path(), "0").await;
    let registry = Arc::new(MemoryRegistry::new());
    let first = publisher(&registry).publish(&image, &tags()).await.unwrap();
    let pushed = registry.events().len();

    let second = publisher(&registry).publish(&image, &tags()).await.unwrap();
    assert_eq!(first.index_reference(), second.index_reference());
    assert!(registry.events()[pushed..]
        .iter()
        .all(|e| !matches!(e, RegistryEvent::Blob { existed: false, .. })));
}

#[tokio::test]
async fn test_index_failure_stops_before_sboms() {
    let repo = repository();
    let image = build(repo.path(), "0").await;
    let registry = Arc::new(MemoryRegistry::new());
    registry.fail_reference(":v1");

    let failure = publisher(&registry).publish(&image, &tags()).await.unwrap_err();
    assert_eq!(failure.error().stage(), Some(PublishStage::Index));
    assert!(!failure.error().is_retryable());
    assert_eq!(failure.reached(), &PublishState::ManifestsPushed);
    assert_eq!(failure.states().len(), 4);
    assert_eq!(
        &failure.states()[..3],
        &[
            PublishState::Pending,
            PublishState::LayersPushed,
            PublishState::ManifestsPushed,
        ]
    );
    assert!(matches!(failure.states()[3], PublishState::Failed(_)));
    assert!(registry.tags(&tags()[0]).is_empty());
    assert!(!registry
        .events()
        .iter()
        .any(|e| matches!(e, RegistryEvent::Manifest { reference, .. } if reference.ends_with(".sbom"))));
}

#[tokio::test]
async fn test_transient_failures_retried() {
    let repo = repository();
    let image = build(repo.path(), "0").await;
    let registry = Arc::new(MemoryRegistry::new());
    registry.fail_transiently(":v1", 1);

    publisher(&registry).publish(&image, &tags()).await.unwrap();
    assert_eq!(registry.attempts(":v1"), 2);
}

#[tokio::test]
async fn test_cancelled_publish() {
    let repo = repository();
    let image = build(repo.path(), "0").await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let registry = Arc::new(MemoryRegistry::new());

    let failure = Publisher::new(registry.clone(), fast_policy(), cancel)
        .publish(&image, &tags())
        .await
        .unwrap_err();
    assert!(matches!(failure.error(), BuildError::Cancelled { .. }));
    assert_eq!(failure.reached(), &PublishState::Pending);
    assert!(registry.events().is_empty());
}

#[tokio::test]
async fn test_publish_without_tags_rejected() {
    let repo = repository();
    let image = build(repo.path(), "0").await;
    let registry = Arc::new(MemoryRegistry::new());
    let failure = publisher(&registry).publish(&image, &[]).await.unwrap_err();
    assert!(matches!(failure.error(), BuildError::ConfigurationError(_)));
    assert!(registry.events().is_empty());
}

#[tokio::test]
async fn test_sbom_timeout_is_isolated() {
    let repo = repository();
    let image = build(repo.path(), "0").await;
    let arch_tag = |arch: stratum_core::Architecture| {
        let image = image.archs().iter().find(|a| a.architecture() == arch).unwrap();
        sbom_tag(image.manifest().digest())
    };
    let slow = arch_tag(stratum_core::Architecture::Arm64);

    let registry = Arc::new(MemoryRegistry::new());
    registry.delay_reference(&slow, Duration::from_secs(30));
    let policy = PushPolicy {
        timeout: Duration::from_millis(200),
        attempts: 1,
        backoff: Duration::from_millis(1),
    };
    let report = Publisher::new(registry.clone(), policy, CancellationToken::new())
        .publish(&image, &tags())
        .await
        .unwrap();

    assert_eq!(report.final_state(), &PublishState::Done);
    assert_eq!(report.sbom_references().len(), 2);
    let published = registry.tags(&tags()[0]);
    assert!(published.contains(&"v1".to_string()));
    assert!(published.contains(&arch_tag(stratum_core::Architecture::Amd64)));
    assert!(published.contains(&sbom_tag(image.index().digest())));
    assert!(!published.contains(&slow));

    match report.into_result() {
        Err(BuildError::PartialFailure { failed }) => {
            assert_eq!(failed.len(), 1);
            assert!(failed[0].ends_with(&slow));
        }
        other => panic!("expected partial failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_while_manifest_push_pending() {
    let repo = repository();
    let image = build(repo.path(), "0").await;
    let registry = Arc::new(MemoryRegistry::new());
    let pending = image.archs()[0].manifest().digest().to_string();
    registry.delay_reference(&pending, Duration::from_secs(30));

    let cancel = CancellationToken::new();
    let policy = PushPolicy {
        timeout: Duration::from_secs(60),
        attempts: 1,
        backoff: Duration::from_millis(1),
    };
    let publisher = Publisher::new(registry.clone(), policy, cancel.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let failure = publisher.publish(&image, &tags()).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(failure.error(), BuildError::Cancelled { .. }));
    assert_eq!(failure.reached(), &PublishState::LayersPushed);

    let events = registry.events();
    assert!(!events.iter().any(|e| matches!(
        e,
        RegistryEvent::Manifest { media_type, .. } if media_type == MEDIA_TYPE_IMAGE_INDEX
    )));
    assert!(!events.iter().any(|e| matches!(
        e,
        RegistryEvent::Manifest { reference, .. } if reference.contains(&pending) || reference.ends_with(".sbom")
    )));
    assert!(registry.tags(&tags()[0]).is_empty());
}

fn layer_files(layer: &stratum_runtime::Layer) -> Vec<String> {
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(layer.blob().bytes()));
    archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

async fn build_layered(repo: &Path) -> BuiltImage {
    let layering = "layering:\n  strategy: origin\n  budget: 2\n";
    BuildEngine::new(
        config_with(repo, "2023-01-01T00:00:00Z", layering),
        Arc::new(LocalResolver::new()),
    )
    .build()
    .await
    .unwrap()
}

#[tokio::test]
async fn test_layered_image_has_ordered_layers() {
    let repo = repository();
    let image = build_layered(repo.path()).await;

    let registry = Arc::new(MemoryRegistry::new());
    publisher(&registry).publish(&image, &tags()).await.unwrap();

    for arch in image.archs() {
        let pinned = tags()[0].with_digest(&arch.manifest().digest().to_string());
        let stored = registry.manifest(&pinned).unwrap();
        let manifest: serde_json::Value = serde_json::from_slice(stored.bytes()).unwrap();
        let layers = manifest["layers"].as_array().unwrap();
        assert_eq!(layers.len(), 2);

        let config: serde_json::Value = serde_json::from_slice(arch.config().blob().bytes()).unwrap();
        for (i, layer) in arch.layers().iter().enumerate() {
            assert_eq!(layers[i]["digest"], layer.blob().digest().to_string());
            assert_eq!(config["rootfs"]["diff_ids"][i], layer.diff_id().to_string());
        }

        let base = layer_files(&arch.layers()[0]);
        assert!(base.contains(&"usr/share/busybox/README".to_string()));
        assert!(!base.iter().any(|p| p.contains("ca-certificates")));
        let top = layer_files(&arch.layers()[1]);
        assert!(top.contains(&"usr/share/ca-certificates/README".to_string()));
        assert!(top.contains(&"etc/apk/world".to_string()));
    }

    let again = build_layered(repo.path()).await;
    assert_eq!(image.index().digest(), again.index().digest());
}
