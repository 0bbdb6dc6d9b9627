//! Toolchain driver capability.
//!
//! The core never shells out to a compiler directly; it goes through
//! [`ToolchainDriver`]. The production implementation is [`gcc::GccDriver`];
//! tests inject recording fakes. Driver calls are synchronous; the executor
//! runs them on blocking worker tasks.

pub mod diagnostics;
pub mod gcc;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::plan::{CompileStep, LinkStep};
use crate::toolchain::diagnostics::Diagnostic;

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("compiler probe failed: {0}")]
    ProbeFailed(String),

    #[error("toolchain binary not found: {tool}")]
    Missing { tool: String },

    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} terminated by signal")]
    SignalTerminated { tool: String },

    #[error("step exceeded its {limit:?} timeout")]
    StepTimeout { limit: Duration },
}

/// Identity of the probed compiler: name, version and target triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompilerInfo {
    pub name: String,
    pub version: String,
    pub target: String,
}

/// Outcome of one compiler invocation. A failed compilation is a successful
/// driver call (`success == false` with diagnostics); [`ToolchainError`] is
/// reserved for infrastructure faults.
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub object_path: PathBuf,
    pub success: bool,
    pub diagnostics: Vec<Diagnostic>,
    pub stderr: String,
    /// Headers the translation unit actually included, from the depfile.
    /// `None` when no dependency information was produced; `Some(vec![])` is
    /// an accurate "includes nothing" observation.
    pub discovered_headers: Option<Vec<PathBuf>>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct LinkResult {
    pub output_path: PathBuf,
    pub success: bool,
    /// Linker stderr, captured as-is (unresolved symbol reports and friends).
    pub stderr: String,
    pub duration: Duration,
}

/// Capability for probing and invoking the native toolchain.
pub trait ToolchainDriver: Send + Sync {
    /// Identify the compiler. Implementations cache per process.
    fn probe(&self) -> Result<CompilerInfo, ToolchainError>;

    fn compile(
        &self,
        step: &CompileStep,
        timeout: Option<Duration>,
    ) -> Result<CompileResult, ToolchainError>;

    fn link(
        &self,
        step: &LinkStep,
        timeout: Option<Duration>,
    ) -> Result<LinkResult, ToolchainError>;
}
