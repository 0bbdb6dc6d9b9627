//! Top-level error type and exit-code mapping.

use thiserror::Error;

use crate::cache::CacheError;
use crate::core::manifest::ManifestError;
use crate::exec::{BuildSummary, ExecError};
use crate::plan::PlanError;
use crate::resolver::ResolveError;
use crate::toolchain::ToolchainError;

/// Exit codes when the core is driven as a tool.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC: i32 = 1;
    pub const INVALID_MANIFEST: i32 = 2;
    pub const BUILD_FAILURE: i32 = 3;
    pub const RESOLVER_FAILURE: i32 = 4;
    /// Distinct from build failure: the user asked us to stop.
    pub const CANCELLED: i32 = 130;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("{0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error("build failed: {} step(s) failed, {} package(s) skipped",
        summary.failed_steps.len(), summary.skipped_packages.len())]
    BuildFailed { summary: BuildSummary },

    #[error("build cancelled")]
    Cancelled { summary: BuildSummary },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Hook(#[from] crate::hooks::HookError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ExecError> for Error {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Toolchain(inner) => Self::Toolchain(inner),
            ExecError::Hook(inner) => Self::Hook(inner),
        }
    }
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Manifest(_) | Self::InvalidArguments(_) => exit_code::INVALID_MANIFEST,
            Self::Resolve(_) => exit_code::RESOLVER_FAILURE,
            Self::BuildFailed { .. } => exit_code::BUILD_FAILURE,
            Self::Cancelled { .. } => exit_code::CANCELLED,
            Self::Plan(_) | Self::Toolchain(_) | Self::Cache(_) | Self::Hook(_) | Self::Io(_) => {
                exit_code::GENERIC
            }
        }
    }
}
