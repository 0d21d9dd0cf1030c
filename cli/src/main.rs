//! Stratum CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stratum_cli::commands::{dispatch, Cli};
use stratum_cli::exit_code;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let fallback = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(exit_code(e.as_ref()));
    }
}
