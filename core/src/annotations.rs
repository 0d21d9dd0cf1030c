//! Declared manifest and index annotations.
//!
//! Annotations end up inside digested documents, so only a declared, sorted
//! key set is allowed and values that would leak host state are rejected.

use std::collections::BTreeMap;

use crate::error::{BuildError, Result};
use crate::timestamp::BuildTimestamp;

/// Annotation key carrying the image creation time.
pub const CREATED_ANNOTATION: &str = "org.opencontainers.image.created";

// Keys whose values are host identity and never reproducible.
const VOLATILE_KEYS: &[&str] = &["hostname", "host", "build.host", "builder.hostname"];

/// A validated, key-sorted annotation set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations(BTreeMap<String, String>);

impl Annotations {
    /// No annotations.
    pub fn none() -> Self {
        Self::default()
    }

    /// Validate a declared annotation set against the build timestamp.
    pub fn declare(
        entries: impl IntoIterator<Item = (String, String)>,
        build_date: &BuildTimestamp,
    ) -> Result<Self> {
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            let key = key.trim().to_string();
            if key.is_empty() {
                return Err(BuildError::ConfigurationError(
                    "annotation key must not be empty".to_string(),
                ));
            }
            if is_volatile_key(&key) {
                return Err(BuildError::ConfigurationError(format!(
                    "annotation '{}' records host state and is not reproducible",
                    key
                )));
            }
            if key == CREATED_ANNOTATION {
                let created = BuildTimestamp::parse(&value)?;
                if created != *build_date {
                    return Err(BuildError::ConfigurationError(format!(
                        "annotation '{}' is '{}' but the build date is '{}'",
                        key, value, build_date
                    )));
                }
            }
            if map.insert(key.clone(), value).is_some() {
                return Err(BuildError::ConfigurationError(format!(
                    "annotation '{}' declared twice",
                    key
                )));
            }
        }
        Ok(Annotations(map))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn is_volatile_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    VOLATILE_KEYS
        .iter()
        .any(|v| lower == *v || lower.ends_with(&format!(".{}", v)))
}
