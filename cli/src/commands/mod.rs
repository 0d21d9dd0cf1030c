//! CLI command definitions and dispatch.

mod build;
mod build_cpio;
mod publish;
mod version;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use stratum_core::{BuildConfig, BuildConfigBuilder, ImageConfiguration};
use tokio_util::sync::CancellationToken;

/// Stratum: reproducible multi-architecture OCI image builder.
#[derive(Parser)]
#[command(name = "stratum", version, about)]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build a standalone CPIO archive for one architecture
    BuildCpio(build_cpio::BuildCpioArgs),
    /// Build a multi-architecture image into an OCI layout directory
    Build(build::BuildArgs),
    /// Build a multi-architecture image and push it to a registry
    Publish(publish::PublishArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Options shared by every build command.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Image configuration file (YAML)
    pub config: PathBuf,

    /// Build date as RFC 3339 or Unix seconds
    #[arg(long, env = "SOURCE_DATE_EPOCH")]
    pub build_date: Option<String>,

    /// Directory to write SBOM documents to
    #[arg(long = "sbom-path")]
    pub sbom_path: Option<PathBuf>,

    /// SBOM formats to generate (comma separated)
    #[arg(long = "sbom-formats", value_delimiter = ',')]
    pub sbom_formats: Option<Vec<String>>,

    /// Extra keyring file to install
    #[arg(short = 'k', long = "keyring-append")]
    pub keyring_append: Vec<String>,

    /// Extra repository used only while resolving packages
    #[arg(short = 'b', long = "build-repository-append")]
    pub build_repository_append: Vec<String>,

    /// Extra repository recorded in the image
    #[arg(short = 'r', long = "repository-append")]
    pub repository_append: Vec<String>,

    /// Extra package to install
    #[arg(short = 'p', long = "package-append")]
    pub package_append: Vec<String>,
}

impl ConfigArgs {
    /// Load the configuration file and apply the shared overrides.
    pub(crate) fn builder(&self) -> Result<BuildConfigBuilder, Box<dyn std::error::Error>> {
        Ok(self.builder_for(self.load()?))
    }

    /// Read the configuration file named on the command line.
    pub(crate) fn load(&self) -> Result<ImageConfiguration, Box<dyn std::error::Error>> {
        Ok(ImageConfiguration::load(&self.config)?)
    }

    /// Apply the shared overrides to an already loaded configuration.
    pub(crate) fn builder_for(&self, image: ImageConfiguration) -> BuildConfigBuilder {
        let mut builder = BuildConfig::builder(image)
            .append_keys(self.keyring_append.iter().cloned())
            .append_build_repositories(self.build_repository_append.iter().cloned())
            .append_repositories(self.repository_append.iter().cloned())
            .append_packages(self.package_append.iter().cloned());
        if let Some(ref date) = self.build_date {
            builder = builder.build_date(date.clone());
        }
        if let Some(ref dir) = self.sbom_path {
            builder = builder.sbom_dir(dir.clone());
        }
        if let Some(ref formats) = self.sbom_formats {
            builder = builder.sbom_formats(formats.iter().cloned());
        }
        builder
    }
}

/// A token cancelled on Ctrl-C.
pub(crate) fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
    token
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::BuildCpio(args) => build_cpio::execute(args).await,
        Command::Build(args) => build::execute(args).await,
        Command::Publish(args) => publish::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
