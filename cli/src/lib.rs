//! Stratum CLI - reproducible multi-architecture image builds.

pub mod commands;

use stratum_core::BuildError;

/// Exit status for a failed command: 2 when only SBOM attachment failed,
/// 1 for anything else.
pub fn exit_code(error: &(dyn std::error::Error + 'static)) -> i32 {
    match error.downcast_ref::<BuildError>() {
        Some(BuildError::PartialFailure { .. }) => 2,
        _ => 1,
    }
}
