//! Image reference parsing.
//!
//! Parses references like `ghcr.io/org/base:v1` into registry, repository,
//! tag and digest. Publishing always targets a repository plus a tag or a
//! digest, so helpers exist to re-point a reference at either.

use std::fmt;

use crate::error::{BuildError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname, optionally with a port
    pub registry: String,
    /// Repository path (e.g., "org/base")
    pub repository: String,
    /// Tag (e.g., "latest", "v1")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `base` → docker.io/library/base:latest
    /// - `org/base:v1` → docker.io/org/base:v1
    /// - `localhost:5000/base` → localhost:5000/base:latest
    /// - `ghcr.io/org/base@sha256:abc...` → digest reference, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty image reference"));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(invalid(reference, "expected digest as algorithm:hex"));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag colon can only appear after the last slash; a colon before it is a port.
        let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let split = last_segment_start + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if let Some(ref tag) = tag {
            validate_tag(reference, tag)?;
        }

        let (registry, repository) = split_registry_repository(reference, name)?;

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Same repository, pointed at a tag.
    pub fn with_tag(&self, tag: &str) -> Self {
        ImageReference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }

    /// Same repository, pointed at a digest.
    pub fn with_digest(&self, digest: &str) -> Self {
        ImageReference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// `registry/repository` without tag or digest.
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// True when both references name the same repository.
    pub fn same_repository(&self, other: &ImageReference) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.repository_path();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_reference())
    }
}

fn invalid(reference: &str, reason: &str) -> BuildError {
    BuildError::ConfigurationError(format!("invalid image reference '{}': {}", reference, reason))
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(invalid(reference, &format!("invalid tag '{}'", tag)))
    }
}

fn split_registry_repository(reference: &str, name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(invalid(reference, "empty repository"));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    if name.is_empty() {
        return Err(invalid(reference, "empty repository"));
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}
