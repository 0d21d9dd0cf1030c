//! Build engine.
//!
//! Each architecture is built as an independent blocking unit: resolve the
//! packages into a fresh working directory, walk the tree into a layer, then
//! derive the config and manifest. Units share only the read-only
//! configuration and resolver. Once every unit is done, the index and SBOM
//! documents are assembled from the finalized digests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use stratum_core::error::{BuildError, Result};
use stratum_core::{Architecture, BuildConfig};
use tokio_util::sync::CancellationToken;

use crate::archive::{
    ArchiveBlob, ArchiveFormat, ArchiveOptions, ArchiveWriter, Compression, FileEntry,
};
use crate::layer::{Layer, LayerBuilder};
use crate::layering;
use crate::oci::descriptor::Descriptor;
use crate::oci::{validate_index, validate_manifest, ImageConfig, Index, LayoutWriter, Manifest};
use crate::resolve::{InstalledPackage, PackageResolver};
use crate::sbom::{generator_for, write_documents, SbomArtifact, SbomComponent, SbomSubject};
use crate::workdir::WorkDir;

const MEDIA_TYPE_CPIO: &str = "application/x-cpio";
const INDEX_SUBJECT: &str = "index";

/// Everything built for one architecture.
#[derive(Debug, Clone)]
pub struct ArchImage {
    architecture: Architecture,
    packages: Vec<InstalledPackage>,
    layers: Vec<Layer>,
    config: ImageConfig,
    manifest: Manifest,
}

impl ArchImage {
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn packages(&self) -> &[InstalledPackage] {
        &self.packages
    }

    /// Layers in application order, base first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

/// A complete multi-architecture build, ready to publish.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    archs: Vec<ArchImage>,
    index: Index,
    sboms: Vec<SbomArtifact>,
}

impl BuiltImage {
    /// Per-architecture images, sorted by architecture.
    pub fn archs(&self) -> &[ArchImage] {
        &self.archs
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// SBOMs for every architecture and for the index.
    pub fn sboms(&self) -> &[SbomArtifact] {
        &self.sboms
    }

    /// Write the image as an OCI image layout directory.
    pub fn write_layout(&self, dir: &Path, ref_name: Option<&str>) -> Result<PathBuf> {
        let writer = LayoutWriter::create(dir)?;
        for image in &self.archs {
            for layer in &image.layers {
                writer.write_blob(layer.blob())?;
            }
            writer.write_blob(image.config.blob())?;
            writer.write_blob(image.manifest.blob())?;
        }
        writer.write_blob(self.index.blob())?;
        writer.finish(&self.index.descriptor(), ref_name)
    }
}

/// Runs builds for a validated configuration.
#[derive(Clone)]
pub struct BuildEngine {
    config: Arc<BuildConfig>,
    resolver: Arc<dyn PackageResolver>,
    cancel: CancellationToken,
}

impl BuildEngine {
    pub fn new(config: BuildConfig, resolver: Arc<dyn PackageResolver>) -> Self {
        Self {
            config: Arc::new(config),
            resolver,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort outstanding work when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Build every configured architecture, then the index and SBOMs.
    pub async fn build(&self) -> Result<BuiltImage> {
        let archs = self.config.archs().to_vec();
        tracing::info!(
            archs = ?archs.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
            build_date = %self.config.build_date(),
            "Starting build"
        );

        let mut images = try_join_all(archs.iter().map(|&arch| self.build_arch(arch))).await?;
        images.sort_by_key(|image| image.architecture);

        let index = Index::assemble(
            images
                .iter()
                .map(|image| (image.architecture, image.manifest.descriptor())),
            self.config.annotations(),
        )?;
        validate_index(index.blob().bytes(), &archs)?;
        tracing::info!(digest = %index.digest(), manifests = images.len(), "Assembled index");

        let sboms = self.generate_sboms(&images, &index)?;
        if let Some(dir) = self.config.sbom_dir() {
            write_documents(dir, &sboms)?;
        }

        Ok(BuiltImage {
            archs: images,
            index,
            sboms,
        })
    }

    /// Build the image for a single architecture.
    pub async fn build_arch(&self, arch: Architecture) -> Result<ArchImage> {
        let config = self.config.clone();
        let resolver = self.resolver.clone();
        self.run_blocking("build", move || build_arch_blocking(&config, resolver.as_ref(), arch))
            .await
    }

    /// Resolve the packages for `arch` and return the tree as sorted entries.
    pub async fn stage(&self, arch: Architecture) -> Result<(Vec<FileEntry>, Vec<InstalledPackage>)> {
        let config = self.config.clone();
        let resolver = self.resolver.clone();
        self.run_blocking("stage", move || {
            let work = WorkDir::new(arch.file_name().as_str())?;
            let root = work.rootfs()?;
            let packages = resolver.resolve(config.contents(), arch, &root)?;
            let entries = LayerBuilder::collect_entries(&root)?;
            Ok((entries, packages))
        })
        .await
    }

    /// Build a standalone CPIO archive for `arch` and write it to `output`.
    ///
    /// The archive is gzip-compressed when `output` ends in `.gz`.
    pub async fn build_cpio(&self, arch: Architecture, output: &Path) -> Result<ArchiveBlob> {
        let (entries, packages) = self.stage(arch).await?;
        let compression = if output.extension().map_or(false, |ext| ext == "gz") {
            Compression::Gzip
        } else {
            Compression::None
        };
        let options = ArchiveOptions::new(ArchiveFormat::Cpio, compression, *self.config.build_date());
        let blob = ArchiveWriter::new(options).write(&entries)?;

        std::fs::write(output, blob.bytes())
            .map_err(|e| BuildError::io(format!("writing {}", output.display()), e))?;
        tracing::info!(
            arch = %arch,
            path = %output.display(),
            digest = %blob.digest(),
            size = blob.size(),
            "Wrote CPIO archive"
        );

        if let Some(dir) = self.config.sbom_dir() {
            let descriptor = Descriptor::of(MEDIA_TYPE_CPIO, &blob);
            let components: Vec<SbomComponent> =
                packages.iter().map(InstalledPackage::to_component).collect();
            let name = arch.file_name();
            let sboms = self.generate(&SbomSubject {
                name: &name,
                descriptor: &descriptor,
                architecture: Some(arch),
                components: &components,
                created: self.config.build_date(),
            })?;
            write_documents(dir, &sboms)?;
        }
        Ok(blob)
    }

    fn generate_sboms(&self, images: &[ArchImage], index: &Index) -> Result<Vec<SbomArtifact>> {
        let mut artifacts = Vec::new();
        if self.config.sbom_formats().is_empty() {
            return Ok(artifacts);
        }

        for image in images {
            let name = image.architecture.file_name();
            let descriptor = image.manifest.descriptor();
            let components: Vec<SbomComponent> =
                image.packages.iter().map(InstalledPackage::to_component).collect();
            artifacts.extend(self.generate(&SbomSubject {
                name: &name,
                descriptor: &descriptor,
                architecture: Some(image.architecture),
                components: &components,
                created: self.config.build_date(),
            })?);
        }

        // The index SBOM lists the child images, not their packages.
        let children: Vec<SbomComponent> = images
            .iter()
            .map(|image| SbomComponent {
                name: format!("image-{}", image.architecture.file_name()),
                version: Some(image.manifest.digest().to_string()),
                source: None,
            })
            .collect();
        let descriptor = index.descriptor();
        artifacts.extend(self.generate(&SbomSubject {
            name: INDEX_SUBJECT,
            descriptor: &descriptor,
            architecture: None,
            components: &children,
            created: self.config.build_date(),
        })?);

        tracing::debug!(count = artifacts.len(), "Generated SBOMs");
        Ok(artifacts)
    }

    fn generate(&self, subject: &SbomSubject<'_>) -> Result<Vec<SbomArtifact>> {
        self.config
            .sbom_formats()
            .iter()
            .map(|&format| SbomArtifact::generate(generator_for(format).as_ref(), subject))
            .collect()
    }

    async fn run_blocking<T, F>(&self, stage: &str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled {
                stage: stage.to_string(),
            });
        }
        let task = tokio::task::spawn_blocking(work);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BuildError::Cancelled { stage: stage.to_string() }),
            joined = task => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => Err(BuildError::Cancelled { stage: stage.to_string() }),
            },
        }
    }
}

fn build_arch_blocking(
    config: &BuildConfig,
    resolver: &dyn PackageResolver,
    arch: Architecture,
) -> Result<ArchImage> {
    let work = WorkDir::new(arch.file_name().as_str())?;
    let root = work.rootfs()?;
    let packages = resolver.resolve(config.contents(), arch, &root)?;

    let entries = LayerBuilder::collect_entries(&root)?;
    let parts = layering::split(&entries, &packages, config.layering());
    let layers = parts
        .iter()
        .map(|part| LayerBuilder::from_entries(part.entries(), arch, config.build_date()))
        .collect::<Result<Vec<_>>>()?;

    let history: Vec<_> = layers
        .iter()
        .zip(&parts)
        .map(|(layer, part)| (layer.diff_id(), part.comment()))
        .collect();
    let image_config = ImageConfig::layered(arch, &history, config.build_date())?;
    let manifest = Manifest::assemble(
        image_config.descriptor(),
        layers.iter().map(Layer::descriptor).collect(),
        config.annotations(),
    )?;
    validate_manifest(manifest.blob().bytes())?;

    tracing::info!(arch = %arch, layers = layers.len(), digest = %manifest.digest(), "Assembled manifest");
    Ok(ArchImage {
        architecture: arch,
        packages,
        layers,
        config: image_config,
        manifest,
    })
}
