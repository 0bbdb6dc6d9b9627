//! Package registry capability.
//!
//! The core treats the registry as a black box returning package sources by
//! (name, version). Network transport, authentication and publishing live
//! outside the core; tests and offline builds inject [`InMemoryRegistry`].

use std::collections::{BTreeMap, HashMap};

use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::core::version::Version;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("package not found: {0}")]
    NotFound(String),

    #[error("no version {version} of {name}")]
    VersionNotFound { name: String, version: Version },

    #[error("no ref `{git_ref}` of {name}")]
    RefNotFound { name: String, git_ref: String },

    #[error("registry transport error: {0}")]
    Transport(String),

    #[error("checksum mismatch for {name}@{version}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        version: Version,
        expected: String,
        actual: String,
    },
}

/// A fetched package source: a gzipped tarball of the package root.
#[derive(Debug, Clone)]
pub struct PackageArchive {
    pub bytes: Vec<u8>,
    /// Hex SHA-256 of `bytes`, when the registry provides one.
    pub checksum: Option<String>,
}

/// Capability for enumerating and fetching package sources.
pub trait Registry: Send + Sync {
    fn list_versions(&self, name: &str) -> Result<Vec<Version>, RegistryError>;

    fn fetch(&self, name: &str, version: &Version) -> Result<PackageArchive, RegistryError>;

    /// Fetch by an opaque git ref. Registries that do not serve refs report
    /// the ref as unknown.
    fn fetch_ref(&self, name: &str, git_ref: &str) -> Result<PackageArchive, RegistryError> {
        Err(RegistryError::RefNotFound {
            name: name.to_string(),
            git_ref: git_ref.to_string(),
        })
    }
}

/// In-memory registry holding pre-built tarballs. The standard test double
/// for the resolver and executor, also usable for hermetic offline builds.
#[derive(Default)]
pub struct InMemoryRegistry {
    packages: HashMap<String, BTreeMap<Version, Vec<u8>>>,
    refs: HashMap<(String, String), Vec<u8>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package version whose tarball contains the given files
    /// (path, contents) plus nothing else. The manifest must be one of the
    /// files for the resolver to accept the package.
    pub fn publish(&mut self, name: &str, version: Version, files: &[(&str, &str)]) {
        let tarball = build_tarball(files);
        self.packages
            .entry(name.to_string())
            .or_default()
            .insert(version, tarball);
    }

    /// Register a tarball served for an opaque git ref.
    pub fn publish_ref(&mut self, name: &str, git_ref: &str, files: &[(&str, &str)]) {
        self.refs
            .insert((name.to_string(), git_ref.to_string()), build_tarball(files));
    }
}

impl Registry for InMemoryRegistry {
    fn list_versions(&self, name: &str) -> Result<Vec<Version>, RegistryError> {
        let versions = self
            .packages
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Ok(versions.keys().cloned().collect())
    }

    fn fetch(&self, name: &str, version: &Version) -> Result<PackageArchive, RegistryError> {
        let bytes = self
            .packages
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?
            .get(version)
            .ok_or_else(|| RegistryError::VersionNotFound {
                name: name.to_string(),
                version: version.clone(),
            })?
            .clone();
        Ok(PackageArchive {
            bytes,
            checksum: None,
        })
    }

    fn fetch_ref(&self, name: &str, git_ref: &str) -> Result<PackageArchive, RegistryError> {
        let bytes = self
            .refs
            .get(&(name.to_string(), git_ref.to_string()))
            .ok_or_else(|| RegistryError::RefNotFound {
                name: name.to_string(),
                git_ref: git_ref.to_string(),
            })?
            .clone();
        Ok(PackageArchive {
            bytes,
            checksum: None,
        })
    }
}

/// Registry backed by a directory of tarballs laid out as
/// `<root>/<name>/<version>.tar.gz`. Covers air-gapped setups and mirrors;
/// the hosted registry client lives outside the core.
pub struct DirectoryRegistry {
    root: std::path::PathBuf,
}

impl DirectoryRegistry {
    pub fn new(root: std::path::PathBuf) -> Self {
        Self { root }
    }
}

impl Registry for DirectoryRegistry {
    fn list_versions(&self, name: &str) -> Result<Vec<Version>, RegistryError> {
        let dir = self.root.join(name);
        let entries = std::fs::read_dir(&dir)
            .map_err(|_| RegistryError::NotFound(name.to_string()))?;
        let mut versions = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = file_name.strip_suffix(".tar.gz") {
                if let Ok(version) = Version::parse(stem) {
                    versions.push(version);
                }
            }
        }
        versions.sort();
        Ok(versions)
    }

    fn fetch(&self, name: &str, version: &Version) -> Result<PackageArchive, RegistryError> {
        let path = self.root.join(name).join(format!("{version}.tar.gz"));
        let bytes = std::fs::read(&path).map_err(|_| RegistryError::VersionNotFound {
            name: name.to_string(),
            version: version.clone(),
        })?;
        Ok(PackageArchive {
            bytes,
            checksum: None,
        })
    }
}

/// Build a gzipped tarball from (path, contents) pairs.
pub fn build_tarball(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .expect("writing to an in-memory tarball cannot fail");
    }
    let encoder = builder.into_inner().expect("tar finalize");
    encoder.finish().expect("gzip finalize")
}
