//! Build configuration.
//!
//! `ImageConfiguration` is the declarative YAML document. `BuildConfig` is the
//! immutable, validated configuration a build runs with: every option is a
//! named field with a default, checked once in `BuildConfigBuilder::build`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::annotations::Annotations;
use crate::arch::Architecture;
use crate::error::{BuildError, Result};
use crate::reference::ImageReference;
use crate::timestamp::BuildTimestamp;

/// Package sources and package list of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct ImageContents {
    /// Repositories recorded in the image and used to resolve packages
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Repositories used to resolve packages but not recorded in the image
    #[serde(default)]
    pub build_repositories: Vec<String>,
    /// Keyring files installed into the image
    #[serde(default)]
    pub keyring: Vec<String>,
    /// Package names, in installation order
    #[serde(default)]
    pub packages: Vec<String>,
}

/// How installed packages are grouped into layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayeringStrategy {
    /// One layer per package origin, in installation order
    #[default]
    Origin,
}

/// Splitting of each image into several layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Layering {
    #[serde(default)]
    pub strategy: LayeringStrategy,
    /// Maximum number of layers per image, including the final layer that
    /// holds everything not given a layer of its own
    pub budget: usize,
}

/// Declarative image configuration, as read from YAML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageConfiguration {
    #[serde(default)]
    pub contents: ImageContents,
    /// Architecture names; empty means the host architecture
    #[serde(default)]
    pub archs: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Absent means a single layer per image
    #[serde(default)]
    pub layering: Option<Layering>,
}

impl ImageConfiguration {
    /// Parse a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BuildError::io(format!("reading {}", path.display()), e))?;
        Self::from_yaml(&text)
    }
}

/// SBOM document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SbomFormat {
    Spdx,
}

impl SbomFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SbomFormat::Spdx => "spdx",
        }
    }

    /// Media type of the document when pushed as a layer.
    pub fn media_type(&self) -> &'static str {
        match self {
            SbomFormat::Spdx => "text/spdx+json",
        }
    }

    /// File extension used in the SBOM output directory.
    pub fn extension(&self) -> &'static str {
        match self {
            SbomFormat::Spdx => "spdx.json",
        }
    }
}

impl FromStr for SbomFormat {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spdx" => Ok(SbomFormat::Spdx),
            other => Err(BuildError::ConfigurationError(format!(
                "unsupported SBOM format: '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SbomFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated, immutable build configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    contents: ImageContents,
    archs: Vec<Architecture>,
    build_date: BuildTimestamp,
    annotations: Annotations,
    tags: Vec<ImageReference>,
    sbom_formats: Vec<SbomFormat>,
    sbom_dir: Option<PathBuf>,
    layering: Option<Layering>,
}

impl BuildConfig {
    pub fn builder(image: ImageConfiguration) -> BuildConfigBuilder {
        BuildConfigBuilder::new(image)
    }

    pub fn contents(&self) -> &ImageContents {
        &self.contents
    }

    /// Target architectures, sorted by name and unique.
    pub fn archs(&self) -> &[Architecture] {
        &self.archs
    }

    pub fn build_date(&self) -> &BuildTimestamp {
        &self.build_date
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Destination tags; all share one repository.
    pub fn tags(&self) -> &[ImageReference] {
        &self.tags
    }

    /// SBOM formats to generate; empty disables SBOMs.
    pub fn sbom_formats(&self) -> &[SbomFormat] {
        &self.sbom_formats
    }

    /// Directory SBOM documents are written to, if any.
    pub fn sbom_dir(&self) -> Option<&Path> {
        self.sbom_dir.as_deref()
    }

    /// Layer split, if the image is built from more than one layer.
    pub fn layering(&self) -> Option<&Layering> {
        self.layering.as_ref()
    }
}

/// Collects options for a `BuildConfig`.
#[derive(Debug, Clone)]
pub struct BuildConfigBuilder {
    image: ImageConfiguration,
    archs: Option<Vec<String>>,
    build_date: Option<String>,
    extra_annotations: Vec<(String, String)>,
    tags: Vec<String>,
    sbom_formats: Option<Vec<String>>,
    sbom_dir: Option<PathBuf>,
    extra_keys: Vec<String>,
    extra_repositories: Vec<String>,
    extra_build_repositories: Vec<String>,
    extra_packages: Vec<String>,
}

impl BuildConfigBuilder {
    fn new(image: ImageConfiguration) -> Self {
        Self {
            image,
            archs: None,
            build_date: None,
            extra_annotations: Vec::new(),
            tags: Vec::new(),
            sbom_formats: None,
            sbom_dir: None,
            extra_keys: Vec::new(),
            extra_repositories: Vec::new(),
            extra_build_repositories: Vec::new(),
            extra_packages: Vec::new(),
        }
    }

    /// Override the architectures listed in the image configuration.
    pub fn archs<I, S>(mut self, archs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.archs = Some(archs.into_iter().map(Into::into).collect());
        self
    }

    /// Build date as RFC 3339 or Unix seconds.
    pub fn build_date(mut self, date: impl Into<String>) -> Self {
        self.build_date = Some(date.into());
        self
    }

    /// Add an annotation, replacing a key of the same name from the document.
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_annotations.push((key.into(), value.into()));
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn sbom_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sbom_formats = Some(formats.into_iter().map(Into::into).collect());
        self
    }

    pub fn sbom_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sbom_dir = Some(dir.into());
        self
    }

    pub fn append_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn append_repositories<I, S>(mut self, repos: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_repositories.extend(repos.into_iter().map(Into::into));
        self
    }

    pub fn append_build_repositories<I, S>(mut self, repos: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_build_repositories
            .extend(repos.into_iter().map(Into::into));
        self
    }

    pub fn append_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_packages.extend(packages.into_iter().map(Into::into));
        self
    }

    /// Validate every option and freeze the configuration.
    pub fn build(self) -> Result<BuildConfig> {
        let build_date = match self.build_date {
            Some(ref date) => BuildTimestamp::parse(date)?,
            None => BuildTimestamp::epoch(),
        };

        let arch_names = self.archs.unwrap_or(self.image.archs);
        let archs = parse_archs(&arch_names)?;

        // options given on the builder replace keys from the document
        let mut declared: Vec<(String, String)> = self.image.annotations.into_iter().collect();
        for (key, value) in self.extra_annotations {
            declared.retain(|(existing, _)| existing.trim() != key.trim());
            declared.push((key, value));
        }
        let annotations = Annotations::declare(declared, &build_date)?;

        let tags = self
            .tags
            .iter()
            .map(|t| ImageReference::parse(t))
            .collect::<Result<Vec<_>>>()?;
        if let Some(first) = tags.first() {
            if let Some(other) = tags.iter().find(|t| !t.same_repository(first)) {
                return Err(BuildError::ConfigurationError(format!(
                    "all tags must share one repository: '{}' and '{}'",
                    first, other
                )));
            }
        }
        if let Some(t) = tags.iter().find(|t| t.tag.is_none()) {
            return Err(BuildError::ConfigurationError(format!(
                "destination '{}' must be a tag, not a digest",
                t
            )));
        }

        let mut sbom_formats = self
            .sbom_formats
            .unwrap_or_else(|| vec![SbomFormat::Spdx.as_str().to_string()])
            .iter()
            .map(|f| f.parse())
            .collect::<Result<Vec<SbomFormat>>>()?;
        sbom_formats.sort();
        sbom_formats.dedup();

        if let Some(layering) = self.image.layering {
            if layering.budget == 0 {
                return Err(BuildError::ConfigurationError(
                    "layering budget must be at least 1".to_string(),
                ));
            }
        }

        let mut contents = self.image.contents;
        append_unique(&mut contents.keyring, self.extra_keys);
        append_unique(&mut contents.repositories, self.extra_repositories);
        append_unique(&mut contents.build_repositories, self.extra_build_repositories);
        append_unique(&mut contents.packages, self.extra_packages);
        dedup_in_place(&mut contents.keyring);
        dedup_in_place(&mut contents.repositories);
        dedup_in_place(&mut contents.build_repositories);
        dedup_in_place(&mut contents.packages);

        tracing::debug!(
            archs = archs.len(),
            packages = contents.packages.len(),
            build_date = %build_date,
            tags = tags.len(),
            "Validated build configuration"
        );
        Ok(BuildConfig {
            contents,
            archs,
            build_date,
            annotations,
            tags,
            sbom_formats,
            sbom_dir: self.sbom_dir,
            layering: self.image.layering,
        })
    }
}

fn parse_archs(names: &[String]) -> Result<Vec<Architecture>> {
    if names.is_empty() {
        let host = Architecture::host().ok_or_else(|| {
            BuildError::ConfigurationError(format!(
                "host architecture '{}' is not supported; list archs explicitly",
                std::env::consts::ARCH
            ))
        })?;
        return Ok(vec![host]);
    }

    let mut archs = Vec::with_capacity(names.len());
    for name in names {
        let arch: Architecture = name.parse()?;
        if archs.contains(&arch) {
            return Err(BuildError::ConfigurationError(format!(
                "duplicate architecture: {}",
                arch
            )));
        }
        archs.push(arch);
    }
    archs.sort();
    Ok(archs)
}

fn append_unique(target: &mut Vec<String>, extra: Vec<String>) {
    for item in extra {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

fn dedup_in_place(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
contents:
  repositories:
    - /srv/repo/main
  keyring:
    - /srv/keys/main.rsa.pub
  packages:
    - busybox
    - ca-certificates
archs:
  - x86_64
  - aarch64
annotations:
  foo: bar
"#;

    #[test]
    fn test_parse_yaml() {
        let image = ImageConfiguration::from_yaml(YAML).unwrap();
        assert_eq!(image.contents.packages, vec!["busybox", "ca-certificates"]);
        assert_eq!(image.archs, vec!["x86_64", "aarch64"]);
        assert_eq!(image.annotations.get("foo"), Some(&"bar".to_string()));
    }

    #[test]
    fn test_parse_layering() {
        let yaml = format!("{}layering:\n  strategy: origin\n  budget: 3\n", YAML);
        let image = ImageConfiguration::from_yaml(&yaml).unwrap();
        let config = BuildConfig::builder(image).build().unwrap();
        assert_eq!(
            config.layering(),
            Some(&Layering {
                strategy: LayeringStrategy::Origin,
                budget: 3
            })
        );

        let defaulted = ImageConfiguration::from_yaml("layering:\n  budget: 2\n").unwrap();
        assert_eq!(defaulted.layering.unwrap().strategy, LayeringStrategy::Origin);
        assert!(BuildConfig::builder(ImageConfiguration::from_yaml(YAML).unwrap())
            .build()
            .unwrap()
            .layering()
            .is_none());
    }

    #[test]
    fn test_zero_layering_budget_rejected() {
        let image = ImageConfiguration::from_yaml("archs: [amd64]\nlayering:\n  budget: 0\n").unwrap();
        let err = BuildConfig::builder(image).build().unwrap_err();
        assert!(err.to_string().contains("layering budget"));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = ImageConfiguration::from_yaml("contents: {}\nentrypoint: /bin/sh\n").unwrap_err();
        assert!(matches!(err, BuildError::Serialization(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("image.yaml");
        std::fs::write(&path, YAML).unwrap();
        let image = ImageConfiguration::load(&path).unwrap();
        assert_eq!(image.contents.repositories, vec!["/srv/repo/main"]);

        let err = ImageConfiguration::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, BuildError::IoFailure { .. }));
    }

    #[test]
    fn test_builder_defaults() {
        let image = ImageConfiguration::from_yaml(YAML).unwrap();
        let config = BuildConfig::builder(image).build().unwrap();
        assert_eq!(config.archs(), &[Architecture::Amd64, Architecture::Arm64]);
        assert_eq!(*config.build_date(), BuildTimestamp::epoch());
        assert_eq!(config.sbom_formats(), &[SbomFormat::Spdx]);
        assert!(config.tags().is_empty());
        assert!(config.sbom_dir().is_none());
    }

    #[test]
    fn test_archs_sorted_and_override() {
        let image = ImageConfiguration::from_yaml(YAML).unwrap();
        let config = BuildConfig::builder(image)
            .archs(["s390x", "arm/v7", "amd64"])
            .build()
            .unwrap();
        assert_eq!(
            config.archs(),
            &[
                Architecture::Amd64,
                Architecture::ArmV7,
                Architecture::S390x
            ]
        );
    }

    #[test]
    fn test_duplicate_arch_rejected() {
        let err = BuildConfig::builder(ImageConfiguration::default())
            .archs(["amd64", "x86_64"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate architecture"));
    }

    #[test]
    fn test_empty_archs_use_host() {
        let config = BuildConfig::builder(ImageConfiguration::default()).build();
        match Architecture::host() {
            Some(host) => assert_eq!(config.unwrap().archs(), &[host]),
            None => assert!(config.is_err()),
        }
    }

    #[test]
    fn test_appends_are_deduplicated() {
        let image = ImageConfiguration::from_yaml(YAML).unwrap();
        let config = BuildConfig::builder(image)
            .append_packages(["busybox", "curl", "curl"])
            .append_repositories(["/srv/repo/extra"])
            .append_build_repositories(["/srv/repo/build"])
            .append_keys(["/srv/keys/main.rsa.pub"])
            .build()
            .unwrap();
        assert_eq!(
            config.contents().packages,
            vec!["busybox", "ca-certificates", "curl"]
        );
        assert_eq!(
            config.contents().repositories,
            vec!["/srv/repo/main", "/srv/repo/extra"]
        );
        assert_eq!(config.contents().build_repositories, vec!["/srv/repo/build"]);
        assert_eq!(config.contents().keyring, vec!["/srv/keys/main.rsa.pub"]);
    }

    #[test]
    fn test_tags_must_share_repository() {
        let err = BuildConfig::builder(ImageConfiguration::default())
            .archs(["amd64"])
            .tags(["ghcr.io/org/a:v1", "ghcr.io/org/b:v1"])
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::ConfigurationError(_)));

        let config = BuildConfig::builder(ImageConfiguration::default())
            .archs(["amd64"])
            .tags(["ghcr.io/org/a:v1", "ghcr.io/org/a:latest"])
            .build()
            .unwrap();
        assert_eq!(config.tags().len(), 2);
    }

    #[test]
    fn test_digest_destination_rejected() {
        let err = BuildConfig::builder(ImageConfiguration::default())
            .archs(["amd64"])
            .tags(["ghcr.io/org/a@sha256:abcd"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("must be a tag"));
    }

    #[test]
    fn test_build_date_and_annotations() {
        let image = ImageConfiguration::from_yaml(YAML).unwrap();
        let config = BuildConfig::builder(image)
            .build_date("1672531200")
            .annotation(crate::annotations::CREATED_ANNOTATION, "2023-01-01T00:00:00Z")
            .build()
            .unwrap();
        assert_eq!(config.build_date().rfc3339(), "2023-01-01T00:00:00Z");
        assert_eq!(config.annotations().get("foo"), Some("bar"));

        let err = BuildConfig::builder(ImageConfiguration::default())
            .archs(["amd64"])
            .build_date("not a date")
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::ConfigurationError(_)));
    }

    #[test]
    fn test_builder_annotation_overrides_document() {
        let image = ImageConfiguration::from_yaml(YAML).unwrap();
        let config = BuildConfig::builder(image)
            .annotation("foo", "baz")
            .annotation("org.opencontainers.image.title", "base")
            .build()
            .unwrap();
        assert_eq!(config.annotations().get("foo"), Some("baz"));
        assert_eq!(config.annotations().get("org.opencontainers.image.title"), Some("base"));
        assert_eq!(config.annotations().as_map().len(), 2);

        let config = BuildConfig::builder(ImageConfiguration::from_yaml(YAML).unwrap())
            .annotation("foo", "first")
            .annotation("foo", "second")
            .build()
            .unwrap();
        assert_eq!(config.annotations().get("foo"), Some("second"));
    }

    #[test]
    fn test_sbom_formats() {
        let config = BuildConfig::builder(ImageConfiguration::default())
            .archs(["amd64"])
            .sbom_formats(Vec::<String>::new())
            .build()
            .unwrap();
        assert!(config.sbom_formats().is_empty());

        let err = BuildConfig::builder(ImageConfiguration::default())
            .archs(["amd64"])
            .sbom_formats(["cyclonedx-xml"])
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::ConfigurationError(_)));
    }
}
