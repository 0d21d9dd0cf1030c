//! `stratum build-cpio` command — Build a CPIO archive of the image tree.
//!
//! Only one architecture is built: `--build-arch`, or the host's. The
//! archive is gzip-compressed when the output name ends in `.gz`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use stratum_core::{Architecture, BuildError};
use stratum_runtime::{BuildEngine, LocalResolver};

use super::ConfigArgs;

#[derive(Args)]
pub struct BuildCpioArgs {
    #[command(flatten)]
    pub common: ConfigArgs,

    /// Output archive path (`.cpio` or `.cpio.gz`)
    pub output: PathBuf,

    /// Architecture to build (default: host architecture)
    #[arg(long)]
    pub build_arch: Option<String>,
}

pub async fn execute(args: BuildCpioArgs) -> Result<(), Box<dyn std::error::Error>> {
    let arch: Architecture = match args.build_arch {
        Some(ref name) => name.parse()?,
        None => Architecture::host().ok_or_else(|| {
            BuildError::ConfigurationError(format!(
                "host architecture '{}' is not supported; pass --build-arch",
                std::env::consts::ARCH
            ))
        })?,
    };

    let image = args.common.load()?;
    if !image.archs.is_empty() {
        tracing::warn!(
            archs = ?image.archs,
            arch = %arch,
            "Ignoring configured architectures; building a single CPIO archive"
        );
    }

    let config = args.common.builder_for(image).archs([arch.as_str()]).build()?;
    let engine = BuildEngine::new(config, Arc::new(LocalResolver::new()))
        .with_cancellation(super::interrupt_token());
    let blob = engine.build_cpio(arch, &args.output).await?;

    println!("{} {}", blob.digest(), args.output.display());
    Ok(())
}
