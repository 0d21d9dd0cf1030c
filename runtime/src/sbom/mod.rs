//! SBOM generation and attachment.
//!
//! A generator turns a subject (one architecture's manifest, or the index)
//! and its components into a document. The document becomes an
//! `SbomArtifact` bound to the subject's finalized digest; the attacher
//! publishes it under a tag derived from that digest.

pub mod attach;
pub mod spdx;

use std::path::{Path, PathBuf};

use stratum_core::error::{BuildError, Result};
use stratum_core::{Architecture, BuildTimestamp, SbomFormat};

use crate::digest::{Blob, ContentDigest};
use crate::oci::descriptor::Descriptor;

pub use attach::{sbom_reference, sbom_tag, SbomAttacher};
pub use spdx::SpdxGenerator;

/// Something an SBOM lists: an installed package, or a child image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbomComponent {
    pub name: String,
    pub version: Option<String>,
    /// Where the component came from (package repository or image digest)
    pub source: Option<String>,
}

/// The artifact an SBOM describes.
#[derive(Debug, Clone, Copy)]
pub struct SbomSubject<'a> {
    /// `amd64`, `arm-v7`, or `index`
    pub name: &'a str,
    pub descriptor: &'a Descriptor,
    pub architecture: Option<Architecture>,
    pub components: &'a [SbomComponent],
    pub created: &'a BuildTimestamp,
}

/// Produces SBOM documents in one format.
pub trait SbomGenerator: Send + Sync {
    fn format(&self) -> SbomFormat;

    fn generate(&self, subject: &SbomSubject<'_>) -> Result<Vec<u8>>;
}

/// Generator for a configured format.
pub fn generator_for(format: SbomFormat) -> Box<dyn SbomGenerator> {
    match format {
        SbomFormat::Spdx => Box::new(SpdxGenerator),
    }
}

/// An SBOM document bound to its subject.
#[derive(Debug, Clone)]
pub struct SbomArtifact {
    subject: Descriptor,
    subject_name: String,
    format: SbomFormat,
    content: Blob,
}

impl SbomArtifact {
    /// Generate the document for a subject whose digest is final.
    pub fn generate(generator: &dyn SbomGenerator, subject: &SbomSubject<'_>) -> Result<Self> {
        let content = generator.generate(subject)?;
        Ok(SbomArtifact {
            subject: subject.descriptor.clone(),
            subject_name: subject.name.to_string(),
            format: generator.format(),
            content: Blob::new(content),
        })
    }

    pub fn subject(&self) -> &Descriptor {
        &self.subject
    }

    pub fn subject_digest(&self) -> &ContentDigest {
        &self.subject.digest
    }

    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }

    pub fn format(&self) -> SbomFormat {
        self.format
    }

    pub fn content(&self) -> &Blob {
        &self.content
    }

    /// `sbom-<subject>.<ext>`
    pub fn file_name(&self) -> String {
        format!("sbom-{}.{}", self.subject_name, self.format.extension())
    }
}

/// Write every artifact into `dir`, creating it if needed.
pub fn write_documents(dir: &Path, artifacts: &[SbomArtifact]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .map_err(|e| BuildError::io(format!("creating SBOM directory {}", dir.display()), e))?;
    let mut written = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let path = dir.join(artifact.file_name());
        std::fs::write(&path, artifact.content().bytes())
            .map_err(|e| BuildError::io(format!("writing {}", path.display()), e))?;
        tracing::debug!(path = %path.display(), subject = %artifact.subject_digest(), "Wrote SBOM");
        written.push(path);
    }
    Ok(written)
}
