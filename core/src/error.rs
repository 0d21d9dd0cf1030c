use std::fmt;

use thiserror::Error;

/// Whether a registry failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network errors and 5xx responses
    Transient,
    /// Authentication, authorization and other 4xx responses
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Publish stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStage {
    Layers,
    Manifests,
    Index,
    Sboms,
}

impl fmt::Display for PublishStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PublishStage::Layers => "layers",
            PublishStage::Manifests => "manifests",
            PublishStage::Index => "index",
            PublishStage::Sboms => "sboms",
        };
        f.write_str(name)
    }
}

/// Stratum error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Invalid or duplicate architecture, bad tag, undeclared annotation
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Archive entry that cannot be written
    #[error("Malformed entry '{path}': {reason}")]
    MalformedEntry { path: String, reason: String },

    /// Local filesystem failure
    #[error("I/O failure ({context}): {source}")]
    IoFailure {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Push rejected or not completed by the registry
    #[error("Registry failure at {stage} for {reference} ({kind}): {message}")]
    RegistryFailure {
        reference: String,
        stage: PublishStage,
        kind: FailureKind,
        message: String,
    },

    /// The image graph was published but some SBOM attachments were not
    #[error("Partial failure: SBOM attachment failed for {}", failed.join(", "))]
    PartialFailure { failed: Vec<String> },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cancellation was requested
    #[error("Cancelled during {stage}")]
    Cancelled { stage: String },

    /// A push exhausted its time budget
    #[error("Timeout at {stage} for {reference}")]
    Timeout {
        reference: String,
        stage: PublishStage,
    },
}

impl BuildError {
    /// Wrap an I/O error with a description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BuildError::IoFailure {
            context: context.into(),
            source,
        }
    }

    /// Build a malformed-entry error.
    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        BuildError::MalformedEntry {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True when rerunning the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BuildError::RegistryFailure {
                kind: FailureKind::Transient,
                ..
            } | BuildError::Timeout { .. }
        )
    }

    /// Publish stage the error belongs to, if it came from a push.
    pub fn stage(&self) -> Option<PublishStage> {
        match self {
            BuildError::RegistryFailure { stage, .. } | BuildError::Timeout { stage, .. } => {
                Some(*stage)
            }
            BuildError::PartialFailure { .. } => Some(PublishStage::Sboms),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        BuildError::io("filesystem operation", err)
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

/// Result type alias for stratum operations
pub type Result<T> = std::result::Result<T, BuildError>;
