//! Registry client backed by `oci-distribution`.
//!
//! Manifests and indexes are pushed as raw bytes so the registry stores
//! exactly the canonical serialization whose digest was computed locally.

use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use stratum_core::ImageReference;

use crate::digest::Blob;
use crate::oci::descriptor::Descriptor;

use super::{PushError, RegistryClient};

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Transport settings for a registry client.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub auth: RegistryAuth,
    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,
}

impl TransportOptions {
    fn protocol(&self) -> ClientProtocol {
        if self.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(self.insecure_registries.clone())
        }
    }
}

/// Pushes content to an OCI distribution registry.
pub struct OciRegistryClient {
    client: Client,
    auth: OciRegistryAuth,
}

impl OciRegistryClient {
    pub fn new(options: TransportOptions) -> Self {
        let config = ClientConfig {
            protocol: options.protocol(),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth: options.auth.to_oci_auth(),
        }
    }

    async fn authorized(&self, target: &ImageReference) -> Result<Reference, PushError> {
        let reference = to_oci_reference(target)?;
        self.client
            .auth(&reference, &self.auth, RegistryOperation::Push)
            .await
            .map_err(|e| classify("authenticating", e))?;
        Ok(reference)
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn push_blob(
        &self,
        target: &ImageReference,
        media_type: &str,
        blob: &Blob,
    ) -> Result<Descriptor, PushError> {
        let reference = self.authorized(target).await?;
        let digest = blob.digest().to_string();
        tracing::debug!(reference = %target, digest = %digest, size = blob.size(), "Pushing blob");
        self.client
            .push_blob(&reference, blob.bytes(), &digest)
            .await
            .map_err(|e| classify("pushing blob", e))?;
        Ok(Descriptor::of(media_type, blob))
    }

    async fn push_manifest(
        &self,
        target: &ImageReference,
        media_type: &str,
        manifest: &Blob,
    ) -> Result<Descriptor, PushError> {
        let reference = self.authorized(target).await?;
        tracing::debug!(reference = %target, digest = %manifest.digest(), "Pushing manifest");
        self.client
            .push_manifest_raw(&reference, manifest.bytes().to_vec(), header(media_type)?)
            .await
            .map_err(|e| classify("pushing manifest", e))?;
        Ok(Descriptor::of(media_type, manifest))
    }
}

fn header<T>(value: &str) -> Result<T, PushError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| PushError::permanent(format!("invalid media type '{}': {}", value, e)))
}

fn to_oci_reference(target: &ImageReference) -> Result<Reference, PushError> {
    let reference = match (&target.digest, &target.tag) {
        (Some(digest), _) => Reference::with_digest(
            target.registry.clone(),
            target.repository.clone(),
            digest.clone(),
        ),
        (None, Some(tag)) => {
            Reference::with_tag(target.registry.clone(), target.repository.clone(), tag.clone())
        }
        (None, None) => {
            return Err(PushError::permanent(format!(
                "reference '{}' has neither tag nor digest",
                target
            )))
        }
    };
    Ok(reference)
}

/// 5xx responses and network errors are transient; everything else is not.
fn classify(action: &str, error: OciDistributionError) -> PushError {
    let message = format!("{}: {}", action, error);
    match &error {
        OciDistributionError::ServerError { code, .. } if *code >= 500 => {
            PushError::transient(message)
        }
        OciDistributionError::RequestError(_) => PushError::transient(message),
        _ => PushError::permanent(message),
    }
}
