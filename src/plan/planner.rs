//! Build planner.
//!
//! Turns a resolved dependency graph into a [`BuildPlan`](crate::plan::BuildPlan):
//! effective flags and include order per package, source expansion, output
//! layout, and a topological package order computed with Kahn's algorithm.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::cache::key;
use crate::core::graph::{DependencyGraph, PackageId};
use crate::core::manifest::{CompilerFamily, PackageType};
use crate::core::package::{Package, PackageError, PackageKey};
use crate::plan::{
    BuildPlan, CompileStep, LinkKind, LinkStep, PackageBuild, PackageLayout, StepId,
};
use crate::toolchain::CompilerInfo;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("package {package} has no sources matching its globs")]
    EmptySources { package: PackageKey },

    #[error("library {package} has no include directory at {}", path.display())]
    MissingIncludeDirectory { package: PackageKey, path: PathBuf },

    #[error("unsupported compiler family `{0}`")]
    UnsupportedCompilerFamily(String),

    #[error("cannot read source {}: {source}", path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Package(#[from] PackageError),
}

/// Non-fatal observations surfaced alongside the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanWarning {
    /// Public headers are not namespaced `include/<name>/...`; dependents
    /// could reach them without the package-name prefix.
    UnnamespacedHeaders { package: PackageKey },
}

impl fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnnamespacedHeaders { package } => {
                write!(f, "{package}: public headers are not namespaced under include/{}", package.name)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// `<root>/.build`; dependencies mirror beneath `deps/` inside it.
    pub build_root: PathBuf,
    /// Global default flags per compiler family, prepended to every package's
    /// own flags.
    pub global_cflags: BTreeMap<CompilerFamily, Vec<String>>,
    pub global_ldflags: BTreeMap<CompilerFamily, Vec<String>>,
    /// Caller-supplied traits; override manifest traits on key collision.
    pub traits: BTreeMap<String, String>,
}

/// Compute the build plan for a resolved graph against a probed compiler.
pub fn plan(
    graph: &DependencyGraph,
    compiler: &CompilerInfo,
    options: &PlanOptions,
) -> Result<BuildPlan, PlanError> {
    let family = CompilerFamily::from_key(&compiler.name)
        .ok_or_else(|| PlanError::UnsupportedCompilerFamily(compiler.name.clone()))?;

    let order = graph.topological_order();

    let mut layout = PackageLayout::default();
    for &id in &order {
        let package = graph.package(id);
        let dir = if id == graph.root() {
            options.build_root.clone()
        } else {
            options.build_root.join("deps").join(package.name())
        };
        layout.assign(package.key(), dir);
    }

    let mut warnings = Vec::new();
    let mut next_step = 0u64;
    let mut packages = Vec::with_capacity(order.len());

    for &id in &order {
        let package = graph.package(id);

        if !package.headers_namespaced()? {
            warnings.push(PlanWarning::UnnamespacedHeaders {
                package: package.key(),
            });
        }

        let include_dirs = include_order(graph, id)?;
        let traits = effective_traits(package, &options.traits);

        let mut flags: Vec<String> = options
            .global_cflags
            .get(&family)
            .cloned()
            .unwrap_or_default();
        flags.extend(package.manifest().compile_flags(family, &traits));

        let sources = package.source_files()?;
        if sources.is_empty() {
            return Err(PlanError::EmptySources {
                package: package.key(),
            });
        }

        let object_dir = layout.object_dir(&package.key());
        let mut compile_steps = Vec::with_capacity(sources.len());
        for source in sources {
            let object = object_dir.join(object_name(package.root(), &source));
            let depfile = object.with_extension("d");

            let source_bytes =
                std::fs::read(&source).map_err(|e| PlanError::SourceUnreadable {
                    path: source.clone(),
                    source: e,
                })?;
            let normalized_includes: Vec<String> =
                include_dirs.iter().map(|p| key::normalize_path(p)).collect();
            let base_key = key::compile_base_key(
                &source_bytes,
                &normalized_includes,
                compiler,
                &flags,
                package.manifest().language,
                &traits,
            );

            compile_steps.push(CompileStep {
                id: StepId(next_step),
                package: package.key(),
                source,
                object,
                depfile,
                flags: flags.clone(),
                include_dirs: include_dirs.clone(),
                language: package.manifest().language,
                traits: traits.clone(),
                base_key,
            });
            next_step += 1;
        }

        let link_step = link_step(
            graph,
            id,
            &layout,
            family,
            options,
            &traits,
            &compile_steps,
            StepId(next_step),
        );
        next_step += 1;

        let direct_dependencies = graph
            .dependencies(id)
            .iter()
            .map(|&dep| graph.package(dep).key())
            .collect();

        packages.push(PackageBuild {
            package: package.key(),
            compile_steps,
            link_step,
            direct_dependencies,
        });
    }

    debug!(
        packages = packages.len(),
        steps = next_step,
        "build plan computed"
    );

    Ok(BuildPlan {
        packages,
        layout,
        warnings,
    })
}

/// Include search order for one package: own public then private include
/// directories, then every transitive dependency's public directory, direct
/// dependencies before transitive, deduplicated by first occurrence.
///
/// A library dependency without an `include/` directory is a plan error: its
/// dependents could never reach its headers.
fn include_order(graph: &DependencyGraph, id: PackageId) -> Result<Vec<PathBuf>, PlanError> {
    let package = graph.package(id);
    let mut dirs = Vec::new();
    for own in [package.public_include_dir(), package.private_include_dir()] {
        if own.is_dir() {
            dirs.push(own);
        }
    }
    for dep_id in graph.transitive_dependencies(id) {
        let dep = graph.package(dep_id);
        let dir = dep.public_include_dir();
        if !dir.is_dir() {
            if dep.manifest().package_type == PackageType::Library {
                return Err(PlanError::MissingIncludeDirectory {
                    package: dep.key(),
                    path: dir,
                });
            }
            continue;
        }
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    Ok(dirs)
}

fn effective_traits(
    package: &Package,
    caller: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut traits = package.manifest().traits.clone();
    for (k, v) in caller {
        traits.insert(k.clone(), v.clone());
    }
    traits
}

/// Object file name: the source stem plus a short digest of its
/// root-relative path, so nested sources with equal stems cannot collide.
fn object_name(package_root: &Path, source: &Path) -> PathBuf {
    let relative = source.strip_prefix(package_root).unwrap_or(source);
    let digest = Sha256::digest(relative.to_string_lossy().as_bytes());
    let stem = relative
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unit".to_string());
    PathBuf::from(format!(
        "{stem}-{:02x}{:02x}{:02x}{:02x}.o",
        digest[0], digest[1], digest[2], digest[3]
    ))
}

#[allow(clippy::too_many_arguments)]
fn link_step(
    graph: &DependencyGraph,
    id: PackageId,
    layout: &PackageLayout,
    family: CompilerFamily,
    options: &PlanOptions,
    traits: &BTreeMap<String, String>,
    compile_steps: &[CompileStep],
    step_id: StepId,
) -> LinkStep {
    let package = graph.package(id);
    let key = package.key();
    let objects: Vec<PathBuf> = compile_steps.iter().map(|s| s.object.clone()).collect();

    match package.manifest().package_type {
        PackageType::Library => LinkStep {
            id: step_id,
            package: key.clone(),
            kind: LinkKind::StaticArchive,
            objects,
            archives: Vec::new(),
            output: layout
                .dir(&key)
                .join(format!("lib{}.a", package.manifest().bare_name())),
            flags: Vec::new(),
        },
        PackageType::Application => {
            // Transitive library archives in topology order, then linker
            // flags collected the same way compile flags are.
            let mut archives = Vec::new();
            let mut flags: Vec<String> = options
                .global_ldflags
                .get(&family)
                .cloned()
                .unwrap_or_default();
            flags.extend(package.manifest().link_flags(family, traits));
            for dep_id in graph.transitive_dependencies(id) {
                let dep = graph.package(dep_id);
                if dep.manifest().package_type == PackageType::Library {
                    archives.push(
                        layout
                            .dir(&dep.key())
                            .join(format!("lib{}.a", dep.manifest().bare_name())),
                    );
                    flags.extend(dep.manifest().link_flags(family, traits));
                }
            }
            LinkStep {
                id: step_id,
                package: key.clone(),
                kind: LinkKind::Executable,
                objects,
                archives,
                output: layout.dir(&key).join(package.manifest().bare_name()),
                flags,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::DependencyGraph;
    use crate::core::manifest::Manifest;
    use crate::core::package::{Package, PackageOrigin};
    use std::fs;

    fn compiler() -> CompilerInfo {
        CompilerInfo {
            name: "gcc".into(),
            version: "13.2.0".into(),
            target: "x86_64-linux-gnu".into(),
        }
    }

    fn write_package(
        dir: &Path,
        name: &str,
        package_type: &str,
        requires: &[(&str, &str)],
        sources: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> Package {
        let mut manifest = format!("name: {name}\nversion: 1.0.0\ntype: {package_type}\n");
        if !requires.is_empty() {
            manifest.push_str("requires:\n");
            for (dep, spec) in requires {
                manifest.push_str(&format!("  {dep}: '{spec}'\n"));
            }
        }
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("package.yml"), &manifest).unwrap();
        for (rel, contents) in sources.iter().chain(headers) {
            let path = dir.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        let manifest = Manifest::load(dir).unwrap();
        Package::new(manifest, dir.to_path_buf(), PackageOrigin::Local)
    }

    /// app -> lib, both with one source; lib exports a namespaced header.
    fn app_with_lib(temp: &Path) -> DependencyGraph {
        let lib = write_package(
            &temp.join("lib"),
            "mathlib",
            "library",
            &[],
            &[("src/mathlib.c", "int add(int a, int b) { return a + b; }\n")],
            &[("include/mathlib/mathlib.h", "int add(int a, int b);\n")],
        );
        let app = write_package(
            &temp.join("app"),
            "calc",
            "application",
            &[("mathlib", "^1.0.0")],
            &[("src/main.c", "#include <mathlib/mathlib.h>\nint main(void){return add(1,2)-3;}\n")],
            &[],
        );
        let mut graph = DependencyGraph::new(app);
        let lib_id = graph.add_package(lib);
        graph.add_edge(graph.root(), lib_id).unwrap();
        graph
    }

    #[test]
    fn plan_orders_dependencies_first() {
        let temp = tempfile::tempdir().unwrap();
        let graph = app_with_lib(temp.path());
        let options = PlanOptions {
            build_root: temp.path().join("app/.build"),
            ..Default::default()
        };
        let plan = plan(&graph, &compiler(), &options).unwrap();

        assert_eq!(plan.packages.len(), 2);
        assert_eq!(plan.packages[0].package.name, "mathlib");
        assert_eq!(plan.packages[1].package.name, "calc");
        assert_eq!(plan.total_steps(), 4);
    }

    #[test]
    fn step_ids_are_monotonic_and_unique() {
        let temp = tempfile::tempdir().unwrap();
        let graph = app_with_lib(temp.path());
        let options = PlanOptions {
            build_root: temp.path().join("app/.build"),
            ..Default::default()
        };
        let plan = plan(&graph, &compiler(), &options).unwrap();

        let mut ids: Vec<u64> = Vec::new();
        for package in &plan.packages {
            for step in &package.compile_steps {
                ids.push(step.id.0);
            }
            ids.push(package.link_step.id.0);
        }
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(ids.len(), sorted.len());
    }

    #[test]
    fn include_order_puts_own_dirs_first() {
        let temp = tempfile::tempdir().unwrap();
        let graph = app_with_lib(temp.path());
        let options = PlanOptions {
            build_root: temp.path().join("app/.build"),
            ..Default::default()
        };
        let plan = plan(&graph, &compiler(), &options).unwrap();

        let app = &plan.packages[1];
        let includes = &app.compile_steps[0].include_dirs;
        // app has no include dirs of its own; lib's public include follows
        assert_eq!(includes.len(), 1);
        assert!(includes[0].ends_with("lib/include"));
    }

    #[test]
    fn application_links_dependency_archives() {
        let temp = tempfile::tempdir().unwrap();
        let graph = app_with_lib(temp.path());
        let options = PlanOptions {
            build_root: temp.path().join("app/.build"),
            ..Default::default()
        };
        let plan = plan(&graph, &compiler(), &options).unwrap();

        let lib = &plan.packages[0];
        assert_eq!(lib.link_step.kind, LinkKind::StaticArchive);
        assert!(lib.link_step.output.ends_with("deps/mathlib/libmathlib.a"));

        let app = &plan.packages[1];
        assert_eq!(app.link_step.kind, LinkKind::Executable);
        assert_eq!(app.link_step.archives, vec![lib.link_step.output.clone()]);
        assert!(app.link_step.output.ends_with(".build/calc"));
    }

    #[test]
    fn empty_sources_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let lonely = write_package(
            &temp.path().join("empty"),
            "empty",
            "library",
            &[],
            &[],
            &[("include/empty/empty.h", "")],
        );
        let graph = DependencyGraph::new(lonely);
        let options = PlanOptions {
            build_root: temp.path().join("empty/.build"),
            ..Default::default()
        };
        assert!(matches!(
            plan(&graph, &compiler(), &options),
            Err(PlanError::EmptySources { .. })
        ));
    }

    #[test]
    fn unnamespaced_headers_warn() {
        let temp = tempfile::tempdir().unwrap();
        let sloppy = write_package(
            &temp.path().join("sloppy"),
            "sloppy",
            "library",
            &[],
            &[("src/s.c", "int s(void){return 0;}\n")],
            &[("include/stray.h", "int s(void);\n")],
        );
        let graph = DependencyGraph::new(sloppy);
        let options = PlanOptions {
            build_root: temp.path().join("sloppy/.build"),
            ..Default::default()
        };
        let plan = plan(&graph, &compiler(), &options).unwrap();
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn library_without_includes_is_fatal_for_dependents() {
        let temp = tempfile::tempdir().unwrap();
        let headerless = write_package(
            &temp.path().join("hl"),
            "headerless",
            "library",
            &[],
            &[("src/x.c", "int x(void){return 0;}\n")],
            &[],
        );
        let app = write_package(
            &temp.path().join("app"),
            "app",
            "application",
            &[("headerless", "^1.0.0")],
            &[("src/main.c", "int main(void){return 0;}\n")],
            &[],
        );
        let mut graph = DependencyGraph::new(app);
        let dep = graph.add_package(headerless);
        graph.add_edge(graph.root(), dep).unwrap();

        let options = PlanOptions {
            build_root: temp.path().join("app/.build"),
            ..Default::default()
        };
        assert!(matches!(
            plan(&graph, &compiler(), &options),
            Err(PlanError::MissingIncludeDirectory { .. })
        ));
    }

    #[test]
    fn unsupported_compiler_family_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let graph = app_with_lib(temp.path());
        let odd = CompilerInfo {
            name: "icc".into(),
            version: "2024".into(),
            target: "x86_64".into(),
        };
        let options = PlanOptions {
            build_root: temp.path().join("app/.build"),
            ..Default::default()
        };
        assert!(matches!(
            plan(&graph, &odd, &options),
            Err(PlanError::UnsupportedCompilerFamily(_))
        ));
    }

    #[test]
    fn nested_sources_get_distinct_objects() {
        assert_ne!(
            object_name(Path::new("/p"), Path::new("/p/src/a/util.c")),
            object_name(Path::new("/p"), Path::new("/p/src/b/util.c")),
        );
    }
}
