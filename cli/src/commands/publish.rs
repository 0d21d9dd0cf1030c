//! `stratum publish` command — Build an image and push it with its SBOMs.
//!
//! Prints the index reference pinned by digest. Exits with status 2 when the
//! image was pushed but some SBOMs could not be attached.

use std::sync::Arc;

use clap::Args;
use stratum_runtime::{
    BuildEngine, LocalResolver, OciRegistryClient, Publisher, PushPolicy, RegistryAuth,
    TransportOptions,
};

use super::ConfigArgs;

#[derive(Args)]
pub struct PublishArgs {
    #[command(flatten)]
    pub common: ConfigArgs,

    /// Destination tags, all in one repository (e.g., "ghcr.io/org/base:v1")
    #[arg(required = true)]
    pub tags: Vec<String>,

    /// Architectures to build, overriding the configuration (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub arch: Vec<String>,

    /// Annotation added to every manifest and the index (KEY=VALUE)
    #[arg(long, value_parser = parse_key_val)]
    pub annotation: Vec<(String, String)>,

    /// Registry to reach over plain HTTP
    #[arg(long)]
    pub insecure_registry: Vec<String>,

    /// Registry username
    #[arg(long, env = "REGISTRY_USERNAME")]
    pub username: Option<String>,

    /// Registry password
    #[arg(long, env = "REGISTRY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Timeout for a single push, in seconds
    #[arg(long, default_value_t = 120)]
    pub push_timeout: u64,

    /// Attempts per push for transient failures
    #[arg(long, default_value_t = 3)]
    pub push_attempts: u32,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    Ok((key.to_string(), value.to_string()))
}

impl PublishArgs {
    fn auth(&self) -> RegistryAuth {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => RegistryAuth::basic(user, pass),
            _ => RegistryAuth::anonymous(),
        }
    }

    fn policy(&self) -> PushPolicy {
        PushPolicy {
            timeout: std::time::Duration::from_secs(self.push_timeout),
            attempts: self.push_attempts,
            ..PushPolicy::default()
        }
    }
}

pub async fn execute(args: PublishArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = args.common.builder()?.tags(args.tags.iter().cloned());
    if !args.arch.is_empty() {
        builder = builder.archs(args.arch.iter().cloned());
    }
    for (key, value) in &args.annotation {
        builder = builder.annotation(key.clone(), value.clone());
    }
    let config = builder.build()?;
    let tags = config.tags().to_vec();

    let cancel = super::interrupt_token();
    let engine = BuildEngine::new(config, Arc::new(LocalResolver::new()))
        .with_cancellation(cancel.clone());
    let image = engine.build().await?;

    let client = OciRegistryClient::new(TransportOptions {
        auth: args.auth(),
        insecure_registries: args.insecure_registry.clone(),
    });
    let publisher = Publisher::new(Arc::new(client), args.policy(), cancel);
    let report = publisher.publish(&image, &tags).await.map_err(|failure| {
        tracing::error!(reached = %failure.reached(), "Publish stopped");
        failure.into_error()
    })?;

    println!("{}", report.index_reference());
    report.into_result()?;
    Ok(())
}
