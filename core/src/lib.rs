//! Stratum Core - Foundational Types
//!
//! Error taxonomy, target architectures, image references and the validated
//! build configuration shared by the runtime and the CLI.

pub mod annotations;
pub mod arch;
pub mod config;
pub mod error;
pub mod reference;
pub mod timestamp;

// Re-export commonly used types
pub use annotations::Annotations;
pub use arch::Architecture;
pub use config::{
    BuildConfig, BuildConfigBuilder, ImageConfiguration, ImageContents, Layering, LayeringStrategy,
    SbomFormat,
};
pub use error::{BuildError, FailureKind, PublishStage, Result};
pub use reference::ImageReference;
pub use timestamp::BuildTimestamp;

/// Stratum version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
