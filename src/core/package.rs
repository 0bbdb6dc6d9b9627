//! Resolved packages.
//!
//! A [`Package`] is a validated manifest plus the filesystem root holding its
//! sources. Local packages build in place; remote packages are materialized
//! into the cache's package store by the resolver.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::manifest::Manifest;
use crate::core::version::Version;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("bad source glob `{pattern}` in {name}: {source}")]
    BadGlob {
        name: String,
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("failed to walk {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where a package's sources came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageOrigin {
    /// Root directory is user-provided and never copied.
    Local,
    /// Root directory lives inside the cache's package store.
    Remote,
}

/// Identity of a package within one resolution: (name, version).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageKey {
    pub name: String,
    pub version: Version,
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A manifest materialized at a concrete filesystem root.
#[derive(Debug, Clone)]
pub struct Package {
    manifest: Manifest,
    root: PathBuf,
    origin: PackageOrigin,
}

impl Package {
    pub fn new(manifest: Manifest, root: PathBuf, origin: PackageOrigin) -> Self {
        Self {
            manifest,
            root,
            origin,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn origin(&self) -> PackageOrigin {
        self.origin
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &Version {
        &self.manifest.version
    }

    pub fn key(&self) -> PackageKey {
        PackageKey {
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
        }
    }

    /// Public headers live under `include/`; consumers are expected to reach
    /// them as `<name>/<header>`.
    pub fn public_include_dir(&self) -> PathBuf {
        self.root.join("include")
    }

    pub fn private_include_dir(&self) -> PathBuf {
        self.root.join("private_include")
    }

    /// Expand the manifest's source globs relative to the package root.
    ///
    /// Results are sorted for determinism. Missing directories simply match
    /// nothing; an undecodable glob pattern is an error.
    pub fn source_files(&self) -> Result<Vec<PathBuf>, PackageError> {
        let mut sources = Vec::new();
        for pattern in &self.manifest.sources {
            let absolute = self.root.join(pattern);
            let pattern_str = absolute.to_string_lossy();
            let paths = glob::glob(&pattern_str).map_err(|source| PackageError::BadGlob {
                name: self.manifest.name.clone(),
                pattern: pattern.clone(),
                source,
            })?;
            for entry in paths.flatten() {
                if entry.is_file() {
                    sources.push(entry);
                }
            }
        }
        sources.sort();
        sources.dedup();
        Ok(sources)
    }

    /// Every file under `include/`, sorted. Used for the conservative cache
    /// key and for artifact bundling.
    pub fn public_headers(&self) -> Result<Vec<PathBuf>, PackageError> {
        let mut headers = Vec::new();
        let dir = self.public_include_dir();
        if dir.is_dir() {
            collect_files(&dir, &mut headers)?;
        }
        headers.sort();
        Ok(headers)
    }

    /// True when the package's public headers are namespaced by its own bare
    /// name (`include/<name>/...`). Unnamespaced headers draw a plan-time
    /// hygiene warning.
    pub fn headers_namespaced(&self) -> Result<bool, PackageError> {
        let dir = self.public_include_dir();
        if !dir.is_dir() {
            return Ok(true);
        }
        let expected = dir.join(self.manifest.bare_name());
        let entries = std::fs::read_dir(&dir).map_err(|source| PackageError::Walk {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| PackageError::Walk {
                path: dir.clone(),
                source,
            })?;
            if entry.path() != expected {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), PackageError> {
    let entries = std::fs::read_dir(dir).map_err(|source| PackageError::Walk {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| PackageError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifest::Manifest;
    use std::fs;

    fn scratch_package(manifest_text: &str) -> (tempfile::TempDir, Package) {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::parse(manifest_text.as_bytes()).unwrap();
        let package = Package::new(manifest, dir.path().to_path_buf(), PackageOrigin::Local);
        (dir, package)
    }

    #[test]
    fn source_globs_expand_sorted() {
        let (dir, package) = scratch_package("name: m\nversion: 1.0.0\ntype: library\n");
        fs::create_dir_all(dir.path().join("src/sub")).unwrap();
        fs::write(dir.path().join("src/zeta.cpp"), "").unwrap();
        fs::write(dir.path().join("src/alpha.c"), "").unwrap();
        fs::write(dir.path().join("src/sub/mid.cc"), "").unwrap();
        fs::write(dir.path().join("src/readme.txt"), "").unwrap();

        let names: Vec<String> = package
            .source_files()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["alpha.c", "mid.cc", "zeta.cpp"]);
    }

    #[test]
    fn missing_src_matches_nothing() {
        let (_dir, package) = scratch_package("name: m\nversion: 1.0.0\ntype: library\n");
        assert!(package.source_files().unwrap().is_empty());
    }

    #[test]
    fn public_headers_walk_include_tree() {
        let (dir, package) = scratch_package("name: m\nversion: 1.0.0\ntype: library\n");
        fs::create_dir_all(dir.path().join("include/m/detail")).unwrap();
        fs::write(dir.path().join("include/m/api.h"), "").unwrap();
        fs::write(dir.path().join("include/m/detail/impl.h"), "").unwrap();

        let headers = package.public_headers().unwrap();
        assert_eq!(headers.len(), 2);
        assert!(package.headers_namespaced().unwrap());
    }

    #[test]
    fn unnamespaced_headers_detected() {
        let (dir, package) = scratch_package("name: m\nversion: 1.0.0\ntype: library\n");
        fs::create_dir_all(dir.path().join("include")).unwrap();
        fs::write(dir.path().join("include/stray.h"), "").unwrap();
        assert!(!package.headers_namespaced().unwrap());
    }
}
