//! Build plans.
//!
//! A plan is the ordered output of the planner: one [`CompileStep`] per
//! source file of each package, one [`LinkStep`] per package, and the
//! [`PackageLayout`] assigning every package an output directory beneath the
//! root's `.build/`. Step ids are monotonic across the whole plan; hook
//! subscribers correlate `Pre`/`Post` pairs by id, never by path.

mod planner;

pub use planner::{plan, PlanError, PlanOptions, PlanWarning};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::cache::key::CacheKey;
use crate::core::manifest::Language;
use crate::core::package::PackageKey;

/// Monotonic step identifier, unique within one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct StepId(pub u64);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Compilation of a single translation unit.
#[derive(Debug, Clone)]
pub struct CompileStep {
    pub id: StepId,
    pub package: PackageKey,
    pub source: PathBuf,
    /// Object output beneath `<layout>/obj/`.
    pub object: PathBuf,
    /// Make-style dependency side-channel file, next to the object.
    pub depfile: PathBuf,
    /// Effective compile flags, in order. Include paths are separate.
    pub flags: Vec<String>,
    /// Include search order: own public and private dirs, then dependency
    /// public dirs in topology order.
    pub include_dirs: Vec<PathBuf>,
    pub language: Language,
    pub traits: BTreeMap<String, String>,
    /// Header-independent portion of the object key; also the lookup key for
    /// header-discovery records.
    pub base_key: CacheKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// `ar`-archive all objects into `lib<name>.a`.
    StaticArchive,
    /// Link objects plus transitive dependency archives into an executable.
    Executable,
}

/// Final link (or archive) of one package.
#[derive(Debug, Clone)]
pub struct LinkStep {
    pub id: StepId,
    pub package: PackageKey,
    pub kind: LinkKind,
    pub objects: Vec<PathBuf>,
    /// Transitive dependency archives, topology order. Empty for archives.
    pub archives: Vec<PathBuf>,
    pub output: PathBuf,
    pub flags: Vec<String>,
}

/// Everything the executor needs to build one package.
#[derive(Debug, Clone)]
pub struct PackageBuild {
    pub package: PackageKey,
    pub compile_steps: Vec<CompileStep>,
    pub link_step: LinkStep,
    /// Direct dependencies whose artifacts feed this package's artifact key.
    pub direct_dependencies: Vec<PackageKey>,
}

/// Output directory assignment: the root package builds at `<root>/.build`,
/// dependencies mirror beneath `<root>/.build/deps/<name>/`.
#[derive(Debug, Clone, Default)]
pub struct PackageLayout {
    dirs: BTreeMap<PackageKey, PathBuf>,
}

impl PackageLayout {
    pub fn assign(&mut self, package: PackageKey, dir: PathBuf) {
        self.dirs.insert(package, dir);
    }

    pub fn dir(&self, package: &PackageKey) -> &Path {
        &self.dirs[package]
    }

    pub fn object_dir(&self, package: &PackageKey) -> PathBuf {
        self.dir(package).join("obj")
    }
}

/// A topologically ordered build plan: every entry's dependencies appear
/// before it, and within an entry all compile steps precede the link step.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub packages: Vec<PackageBuild>,
    pub layout: PackageLayout,
    pub warnings: Vec<PlanWarning>,
}

impl BuildPlan {
    pub fn compile_step_count(&self) -> usize {
        self.packages.iter().map(|p| p.compile_steps.len()).sum()
    }

    pub fn link_step_count(&self) -> usize {
        self.packages.len()
    }

    pub fn total_steps(&self) -> usize {
        self.compile_step_count() + self.link_step_count()
    }

    /// Build order as package keys, dependencies first.
    pub fn package_order(&self) -> Vec<PackageKey> {
        self.packages.iter().map(|p| p.package.clone()).collect()
    }
}
