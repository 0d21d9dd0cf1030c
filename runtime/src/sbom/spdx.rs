//! SPDX 2.3 JSON documents.
//!
//! The subject is the described root package; every component is a package
//! contained by it. Nothing in the document depends on the host or clock.

use serde::Serialize;
use stratum_core::error::Result;
use stratum_core::SbomFormat;

use crate::digest::canonical_json;

use super::{SbomComponent, SbomGenerator, SbomSubject};

const SPDX_VERSION: &str = "SPDX-2.3";
const DATA_LICENSE: &str = "CC0-1.0";
const DOCUMENT_ID: &str = "SPDXRef-DOCUMENT";
const SUBJECT_ID: &str = "SPDXRef-Subject";
const NAMESPACE_PREFIX: &str = "https://spdx.stratum.build";
const NOASSERTION: &str = "NOASSERTION";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    spdx_version: &'static str,
    data_license: &'static str,
    #[serde(rename = "SPDXID")]
    spdx_id: &'static str,
    name: String,
    document_namespace: String,
    creation_info: CreationInfo,
    packages: Vec<Package>,
    relationships: Vec<Relationship>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreationInfo {
    created: String,
    creators: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Package {
    #[serde(rename = "SPDXID")]
    spdx_id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version_info: Option<String>,
    download_location: String,
    files_analyzed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    primary_package_purpose: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Relationship {
    spdx_element_id: String,
    relationship_type: &'static str,
    related_spdx_element: String,
}

/// Generates SPDX 2.3 JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpdxGenerator;

impl SbomGenerator for SpdxGenerator {
    fn format(&self) -> SbomFormat {
        SbomFormat::Spdx
    }

    fn generate(&self, subject: &SbomSubject<'_>) -> Result<Vec<u8>> {
        let digest = &subject.descriptor.digest;

        let mut packages = vec![Package {
            spdx_id: SUBJECT_ID.to_string(),
            name: subject.name.to_string(),
            version_info: Some(digest.to_string()),
            download_location: NOASSERTION.to_string(),
            files_analyzed: false,
            primary_package_purpose: Some("CONTAINER"),
            comment: subject
                .architecture
                .map(|arch| format!("architecture {}", arch)),
        }];
        let mut relationships = vec![Relationship {
            spdx_element_id: DOCUMENT_ID.to_string(),
            relationship_type: "DESCRIBES",
            related_spdx_element: SUBJECT_ID.to_string(),
        }];

        for (position, component) in subject.components.iter().enumerate() {
            let id = component_id(position, component);
            relationships.push(Relationship {
                spdx_element_id: SUBJECT_ID.to_string(),
                relationship_type: "CONTAINS",
                related_spdx_element: id.clone(),
            });
            packages.push(Package {
                spdx_id: id,
                name: component.name.clone(),
                version_info: component.version.clone(),
                download_location: component
                    .source
                    .clone()
                    .unwrap_or_else(|| NOASSERTION.to_string()),
                files_analyzed: false,
                primary_package_purpose: None,
                comment: None,
            });
        }

        let document = Document {
            spdx_version: SPDX_VERSION,
            data_license: DATA_LICENSE,
            spdx_id: DOCUMENT_ID,
            name: format!("sbom-{}", subject.name),
            document_namespace: format!("{}/{}/{}", NAMESPACE_PREFIX, subject.name, digest.hex()),
            creation_info: CreationInfo {
                created: subject.created.rfc3339(),
                creators: vec![format!("Tool: stratum-{}", stratum_core::VERSION)],
            },
            packages,
            relationships,
        };
        canonical_json(&document)
    }
}

/// SPDX identifiers allow only letters, digits, `.` and `-`.
fn component_id(position: usize, component: &SbomComponent) -> String {
    let name: String = component
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
        .collect();
    format!("SPDXRef-Package-{}-{}", position, name)
}
