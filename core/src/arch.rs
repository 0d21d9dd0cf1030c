//! Target architectures.
//!
//! Architectures are named the way OCI platforms name them (`amd64`, `arm64`,
//! `arm/v7`). Common aliases from other ecosystems are accepted on parse.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::BuildError;

/// A CPU architecture an image can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Amd64,
    Arm64,
    ArmV6,
    ArmV7,
    I386,
    Ppc64le,
    S390x,
    Riscv64,
    Loong64,
}

impl Architecture {
    /// Every supported architecture.
    pub const ALL: [Architecture; 9] = [
        Architecture::Amd64,
        Architecture::Arm64,
        Architecture::ArmV6,
        Architecture::ArmV7,
        Architecture::I386,
        Architecture::Ppc64le,
        Architecture::S390x,
        Architecture::Riscv64,
        Architecture::Loong64,
    ];

    /// Canonical name, including the variant (`arm/v7`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
            Architecture::ArmV6 => "arm/v6",
            Architecture::ArmV7 => "arm/v7",
            Architecture::I386 => "386",
            Architecture::Ppc64le => "ppc64le",
            Architecture::S390x => "s390x",
            Architecture::Riscv64 => "riscv64",
            Architecture::Loong64 => "loong64",
        }
    }

    /// The `architecture` field of an OCI platform.
    pub fn oci_architecture(&self) -> &'static str {
        match self {
            Architecture::ArmV6 | Architecture::ArmV7 => "arm",
            other => other.as_str(),
        }
    }

    /// The `variant` field of an OCI platform.
    pub fn oci_variant(&self) -> Option<&'static str> {
        match self {
            Architecture::ArmV6 => Some("v6"),
            Architecture::ArmV7 => Some("v7"),
            _ => None,
        }
    }

    /// Name used by apk package repositories.
    pub fn apk_name(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "x86_64",
            Architecture::Arm64 => "aarch64",
            Architecture::ArmV6 => "armhf",
            Architecture::ArmV7 => "armv7",
            Architecture::I386 => "x86",
            Architecture::Ppc64le => "ppc64le",
            Architecture::S390x => "s390x",
            Architecture::Riscv64 => "riscv64",
            Architecture::Loong64 => "loongarch64",
        }
    }

    /// Name usable as a single path component (`arm-v7`).
    pub fn file_name(&self) -> String {
        self.as_str().replace('/', "-")
    }

    /// Architecture of the running host.
    pub fn host() -> Option<Architecture> {
        std::env::consts::ARCH.parse().ok()
    }
}

impl FromStr for Architecture {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let arch = match s.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" => Architecture::Amd64,
            "arm64" | "aarch64" | "arm64/v8" => Architecture::Arm64,
            "arm/v6" | "armhf" | "armv6" => Architecture::ArmV6,
            "arm/v7" | "armv7" | "arm" => Architecture::ArmV7,
            "386" | "i386" | "x86" => Architecture::I386,
            "ppc64le" => Architecture::Ppc64le,
            "s390x" => Architecture::S390x,
            "riscv64" => Architecture::Riscv64,
            "loong64" | "loongarch64" => Architecture::Loong64,
            other => {
                return Err(BuildError::ConfigurationError(format!(
                    "unsupported architecture: '{}'",
                    other
                )))
            }
        };
        Ok(arch)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Ordered by canonical name so index entries sort the way registries display them.
impl Ord for Architecture {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl PartialOrd for Architecture {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Architecture {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Architecture {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}
