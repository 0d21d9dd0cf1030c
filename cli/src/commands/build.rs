//! `stratum build` command — Build an image into an OCI layout directory.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use stratum_runtime::{BuildEngine, LocalResolver};

use super::ConfigArgs;

#[derive(Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub common: ConfigArgs,

    /// Output directory for the OCI image layout
    pub output: PathBuf,

    /// Architectures to build, overriding the configuration (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub arch: Vec<String>,

    /// Name recorded for the image in the layout's index.json
    #[arg(long)]
    pub ref_name: Option<String>,
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = args.common.builder()?;
    if !args.arch.is_empty() {
        builder = builder.archs(args.arch.iter().cloned());
    }
    let config = builder.build()?;

    let engine = BuildEngine::new(config, Arc::new(LocalResolver::new()))
        .with_cancellation(super::interrupt_token());
    let image = engine.build().await?;
    let root = image.write_layout(&args.output, args.ref_name.as_deref())?;

    println!("{} {}", image.index().digest(), root.display());
    Ok(())
}
