//! clyde - package manager and build orchestrator for C and C++ projects.
//!
//! The core pipeline is Manifest -> Resolved Dependency Graph -> Build Plan
//! -> Cached Compilation -> Linked Artifact. The registry and the native
//! toolchain are injected capabilities ([`registry::Registry`],
//! [`toolchain::ToolchainDriver`]), which is what makes the resolver and
//! executor testable against in-memory fakes.

pub mod cache;
pub mod cmd;
pub mod core;
pub mod exec;
pub mod hooks;
pub mod ops;
pub mod plan;
pub mod registry;
pub mod resolver;
pub mod toolchain;

use std::path::{Path, PathBuf};

/// Cache root: `$CLYDE_CACHE` when set, `<user-cache>/clydepm` otherwise.
pub fn cache_root() -> PathBuf {
    std::env::var_os("CLYDE_CACHE")
        .map(PathBuf::from)
        .unwrap_or_else(cache::BuildCache::default_root)
}

/// Per-build output directory beneath a package root.
pub fn build_dir(package_root: &Path) -> PathBuf {
    package_root.join(".build")
}
