//! Dependency resolution.
//!
//! Transforms a root package into a fully materialized [`DependencyGraph`]
//! by fetching and recursively resolving requirements. The resolver never
//! backtracks: when a later requirement excludes an already-chosen version,
//! it reports the conflict with the origin chain of every constraint so the
//! user can pin their way out. All errors are fatal and carry the
//! requirement path from the root.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{BuildCache, CacheError};
use crate::core::constraint::{Intersection, VersionConstraint};
use crate::core::graph::{DependencyGraph, PackageId};
use crate::core::manifest::{Manifest, ManifestError};
use crate::core::package::{Package, PackageKey, PackageOrigin};
use crate::core::version::Version;
use crate::hooks::{BuildEvent, HookBus, HookError};
use crate::registry::{Registry, RegistryError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no version of {name} satisfies {constraint} (available: {})\n  required via {}",
        format_versions(available), format_chain(chain))]
    NoCompatibleVersion {
        name: String,
        constraint: String,
        available: Vec<Version>,
        chain: Vec<PackageKey>,
    },

    #[error("conflicting requirements on {name}: {}\n  required by {}",
        constraints.join(", "), format_chain(origins))]
    VersionConflict {
        name: String,
        constraints: Vec<String>,
        origins: Vec<PackageKey>,
    },

    #[error("circular dependency: {}", format_chain(path))]
    CircularDependency { path: Vec<PackageKey> },

    #[error("failed to fetch {name}: {source}\n  required via {}", format_chain(chain))]
    FetchFailed {
        name: String,
        chain: Vec<PackageKey>,
        #[source]
        source: RegistryError,
    },

    #[error("invalid manifest for {name}: {source}")]
    BadManifest {
        name: String,
        #[source]
        source: ManifestError,
    },

    #[error("local dependency {name} not found at {} (required by {requested_by})", path.display())]
    MissingLocalPackage {
        name: String,
        path: PathBuf,
        requested_by: PackageKey,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Hook(#[from] HookError),
}

fn format_chain(chain: &[PackageKey]) -> String {
    if chain.is_empty() {
        return "root".to_string();
    }
    chain
        .iter()
        .map(PackageKey::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_versions(versions: &[Version]) -> String {
    if versions.is_empty() {
        return "none".to_string();
    }
    versions
        .iter()
        .map(Version::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Where a chosen package came from; later constraints must agree with it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChosenSource {
    Registry(Version),
    Local(PathBuf),
    Git(String),
}

struct Resolution<'a> {
    registry: &'a dyn Registry,
    cache: &'a BuildCache,
    bus: &'a HookBus,
    graph: DependencyGraph,
    /// Requirement provenance: child id -> the id that first required it.
    parent: HashMap<PackageId, PackageId>,
    /// Every constraint recorded per name, with its requester.
    constraints: HashMap<String, Vec<(PackageId, VersionConstraint)>>,
    chosen: HashMap<String, (PackageId, ChosenSource)>,
    worklist: VecDeque<(String, VersionConstraint, PackageId)>,
}

/// Resolve the dependency closure of `root` against a registry, materializing
/// remote packages into the cache's package store.
pub fn resolve(
    root: Package,
    registry: &dyn Registry,
    cache: &BuildCache,
    bus: &HookBus,
) -> Result<DependencyGraph, ResolveError> {
    bus.emit(&BuildEvent::PreResolution { root: root.key() })?;

    let root_requires = root.manifest().requires.clone();
    let graph = DependencyGraph::new(root);
    let root_id = graph.root();

    let mut resolution = Resolution {
        registry,
        cache,
        bus,
        graph,
        parent: HashMap::new(),
        constraints: HashMap::new(),
        chosen: HashMap::new(),
        worklist: VecDeque::new(),
    };

    for (name, constraint) in root_requires {
        resolution.worklist.push_back((name, constraint, root_id));
    }

    while let Some((name, constraint, origin)) = resolution.worklist.pop_front() {
        resolution.step(&name, constraint, origin)?;
    }

    let graph = resolution.graph;
    bus.emit(&BuildEvent::PostResolution {
        package_count: graph.len(),
    })?;
    Ok(graph)
}

impl<'a> Resolution<'a> {
    /// Requirement chain from the root down to (and including) `id`.
    fn chain(&self, id: PackageId) -> Vec<PackageKey> {
        let mut ids = vec![id];
        let mut cursor = id;
        while let Some(&up) = self.parent.get(&cursor) {
            ids.push(up);
            cursor = up;
        }
        if *ids.last().unwrap() != self.graph.root() {
            ids.push(self.graph.root());
        }
        ids.reverse();
        ids.dedup();
        ids.into_iter()
            .map(|id| self.graph.package(id).key())
            .collect()
    }

    fn conflict(&self, name: &str) -> ResolveError {
        let recorded = &self.constraints[name];
        ResolveError::VersionConflict {
            name: name.to_string(),
            constraints: recorded.iter().map(|(_, c)| c.to_string()).collect(),
            origins: recorded
                .iter()
                .map(|(id, _)| self.graph.package(*id).key())
                .collect(),
        }
    }

    fn step(
        &mut self,
        name: &str,
        constraint: VersionConstraint,
        origin: PackageId,
    ) -> Result<(), ResolveError> {
        self.bus.emit(&BuildEvent::PackageDiscovered {
            name: name.to_string(),
            constraint: constraint.to_string(),
            requested_by: self.graph.package(origin).key(),
        })?;

        self.constraints
            .entry(name.to_string())
            .or_default()
            .push((origin, constraint));

        let all: Vec<VersionConstraint> = self.constraints[name]
            .iter()
            .map(|(_, c)| c.clone())
            .collect();
        let narrowed = match VersionConstraint::intersect_all(&all) {
            Intersection::Narrowed(narrowed) => narrowed,
            Intersection::Unsatisfiable => return Err(self.conflict(name)),
        };

        if let Some((chosen_id, source)) = self.chosen.get(name).cloned() {
            let version = self.graph.package(chosen_id).version().clone();
            if !Self::admitted(&narrowed, &source, &version) {
                return Err(self.conflict(name));
            }
            self.link(origin, chosen_id)?;
            return Ok(());
        }

        let (package, source) = self.select(name, &narrowed, origin)?;
        self.bus.emit(&BuildEvent::VersionSelected {
            name: name.to_string(),
            version: package.version().clone(),
        })?;

        if package.name() != name {
            warn!(
                requested = name,
                found = package.name(),
                "manifest name differs from requirement"
            );
        }

        let requires = package.manifest().requires.clone();
        let id = self.graph.add_package(package);
        self.chosen.insert(name.to_string(), (id, source));
        self.parent.insert(id, origin);
        self.link(origin, id)?;

        for (dep_name, dep_constraint) in requires {
            self.worklist.push_back((dep_name, dep_constraint, id));
        }
        Ok(())
    }

    /// Does the narrowed constraint still admit the already-chosen package?
    fn admitted(narrowed: &VersionConstraint, source: &ChosenSource, version: &Version) -> bool {
        match (narrowed, source) {
            (VersionConstraint::LocalPath(want), ChosenSource::Local(have)) => {
                normalize(want) == *have
            }
            (VersionConstraint::GitRef(want), ChosenSource::Git(have)) => want == have,
            (VersionConstraint::LocalPath(_) | VersionConstraint::GitRef(_), _) => false,
            (window, _) => window.satisfies(version),
        }
    }

    fn link(&mut self, from: PackageId, to: PackageId) -> Result<(), ResolveError> {
        self.graph.add_edge(from, to).map_err(|cycle| {
            let mut path = self.chain(to);
            path.pop();
            path.extend(cycle);
            ResolveError::CircularDependency { path }
        })
    }

    /// Materialize the single candidate admitted by the narrowed constraint.
    fn select(
        &mut self,
        name: &str,
        narrowed: &VersionConstraint,
        origin: PackageId,
    ) -> Result<(Package, ChosenSource), ResolveError> {
        match narrowed {
            VersionConstraint::LocalPath(path) => self.select_local(name, path, origin),
            VersionConstraint::GitRef(git_ref) => self.select_git(name, git_ref, origin),
            _ => self.select_registry(name, narrowed, origin),
        }
    }

    fn select_local(
        &self,
        name: &str,
        path: &PathBuf,
        origin: PackageId,
    ) -> Result<(Package, ChosenSource), ResolveError> {
        let requester = self.graph.package(origin);
        let resolved = if path.is_absolute() {
            path.clone()
        } else {
            requester.root().join(path)
        };
        let resolved = resolved.canonicalize().map_err(|_| {
            ResolveError::MissingLocalPackage {
                name: name.to_string(),
                path: resolved.clone(),
                requested_by: requester.key(),
            }
        })?;
        let manifest =
            Manifest::load(&resolved).map_err(|source| ResolveError::BadManifest {
                name: name.to_string(),
                source,
            })?;
        debug!(package = name, path = %resolved.display(), "using local package in place");
        Ok((
            Package::new(manifest, resolved.clone(), PackageOrigin::Local),
            ChosenSource::Local(resolved),
        ))
    }

    fn select_git(
        &mut self,
        name: &str,
        git_ref: &str,
        origin: PackageId,
    ) -> Result<(Package, ChosenSource), ResolveError> {
        let label = format!("git-{}", git_ref.replace(['/', ':'], "-"));
        let dir = self.cache.package_dir(name, &label);
        let dir = if dir.is_dir() {
            dir
        } else {
            let archive = self.registry.fetch_ref(name, git_ref).map_err(|source| {
                ResolveError::FetchFailed {
                    name: name.to_string(),
                    chain: self.chain(origin),
                    source,
                }
            })?;
            let dir = self.cache.materialize_package(name, &label, &archive.bytes)?;
            self.emit_fetched(name, &dir)?;
            dir
        };
        let manifest = Manifest::load(&dir).map_err(|source| ResolveError::BadManifest {
            name: name.to_string(),
            source,
        })?;
        Ok((
            Package::new(manifest, dir, PackageOrigin::Remote),
            ChosenSource::Git(git_ref.to_string()),
        ))
    }

    fn select_registry(
        &mut self,
        name: &str,
        narrowed: &VersionConstraint,
        origin: PackageId,
    ) -> Result<(Package, ChosenSource), ResolveError> {
        let available =
            self.registry
                .list_versions(name)
                .map_err(|source| ResolveError::FetchFailed {
                    name: name.to_string(),
                    chain: self.chain(origin),
                    source,
                })?;

        // Greatest admitted version; among equals prefer stable, then the
        // lexicographically greatest full version string.
        let best = available
            .iter()
            .filter(|v| narrowed.satisfies(v))
            .max_by(|a, b| {
                a.cmp(b)
                    .then_with(|| a.pre.is_none().cmp(&b.pre.is_none()))
                    .then_with(|| a.to_string().cmp(&b.to_string()))
            })
            .cloned();
        let version = best.ok_or_else(|| ResolveError::NoCompatibleVersion {
            name: name.to_string(),
            constraint: narrowed.to_string(),
            available: available.clone(),
            chain: self.chain(origin),
        })?;

        let label = version.to_string();
        let dir = self.cache.package_dir(name, &label);
        let dir = if dir.is_dir() {
            debug!(package = name, version = %version, "package store hit");
            dir
        } else {
            let archive =
                self.registry
                    .fetch(name, &version)
                    .map_err(|source| ResolveError::FetchFailed {
                        name: name.to_string(),
                        chain: self.chain(origin),
                        source,
                    })?;
            let dir = self.cache.materialize_package(name, &label, &archive.bytes)?;
            self.emit_fetched(name, &dir)?;
            dir
        };
        let manifest = Manifest::load(&dir).map_err(|source| ResolveError::BadManifest {
            name: name.to_string(),
            source,
        })?;
        Ok((
            Package::new(manifest, dir, PackageOrigin::Remote),
            ChosenSource::Registry(version),
        ))
    }

    fn emit_fetched(&self, name: &str, dir: &std::path::Path) -> Result<(), ResolveError> {
        // The manifest may be unreadable; fetched is still worth reporting.
        let key = Manifest::load(dir)
            .map(|m| PackageKey {
                name: m.name.clone(),
                version: m.version,
            })
            .unwrap_or_else(|_| PackageKey {
                name: name.to_string(),
                version: Version::new(0, 0, 0),
            });
        self.bus.emit(&BuildEvent::PackageFetched { package: key })?;
        Ok(())
    }
}

fn normalize(path: &PathBuf) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.clone())
}
