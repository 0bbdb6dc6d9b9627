//! Content-addressed build cache.
//!
//! Two value tiers live under the cache root: compiled objects
//! (`objects/<aa>/<rest>.o`) and linked artifacts (`artifacts/<aa>/<rest>.tar`,
//! a bundle of the artifact plus its public headers). Alongside them sit the
//! package store (`packages/<name>/<version>/`, materialized registry
//! fetches), header-discovery records (`deps/<aa>/<rest>.json`) and a summary
//! `index.json`.
//!
//! All writes go to a unique temp name first and are renamed into place, so
//! concurrent builds race benignly: the loser's rename replaces the winner's
//! byte-identical file. Reads are lock-free and fail-safe: a read error is a
//! miss, a corrupt entry is purged and reported as a miss.

pub mod key;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::key::{CacheKey, CACHE_FORMAT_VERSION};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache read failed at {}: {source}", path.display())]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache write failed at {}: {source}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt cache entry at {}", path.display())]
    CorruptEntry { path: PathBuf },

    #[error("cache root is locked by another process ({})", path.display())]
    Locked { path: PathBuf },
}

/// Which value tier an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Objects,
    Artifacts,
}

/// One enumerable cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub tier: CacheTier,
    pub key: CacheKey,
    pub size: u64,
}

/// Summary index, rewritten atomically after builds and evictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheIndex {
    pub format_version: u8,
    pub objects: usize,
    pub artifacts: usize,
    pub packages: usize,
}

/// A retrieved artifact bundle: tar bytes plus safe extraction.
pub struct ArtifactBundle {
    bytes: Vec<u8>,
}

impl ArtifactBundle {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Unpack into `dest`, preserving file modes. Entries that would escape
    /// the destination or are links are rejected by the tar layer.
    pub fn unpack_into(&self, dest: &Path) -> Result<(), CacheError> {
        fs::create_dir_all(dest).map_err(|source| CacheError::WriteFailure {
            path: dest.to_path_buf(),
            source,
        })?;
        let mut archive = tar::Archive::new(self.bytes.as_slice());
        archive.set_preserve_permissions(true);
        archive
            .unpack(dest)
            .map_err(|source| CacheError::WriteFailure {
                path: dest.to_path_buf(),
                source,
            })
    }
}

/// Handle to the on-disk cache layout.
pub struct BuildCache {
    root: PathBuf,
}

impl BuildCache {
    /// Default cache root: `<user-cache>/clydepm`.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("clydepm")
    }

    pub fn open(root: PathBuf) -> Result<Self, CacheError> {
        let cache = Self { root };
        for dir in [
            cache.objects_dir(),
            cache.artifacts_dir(),
            cache.packages_dir(),
            cache.deps_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|source| CacheError::WriteFailure {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    fn deps_dir(&self) -> PathBuf {
        self.root.join("deps")
    }

    fn tier_path(&self, tier: CacheTier, key: &CacheKey) -> PathBuf {
        let (prefix, rest) = key.shard();
        match tier {
            CacheTier::Objects => self.objects_dir().join(prefix).join(format!("{rest}.o")),
            CacheTier::Artifacts => self.artifacts_dir().join(prefix).join(format!("{rest}.tar")),
        }
    }

    fn dep_record_path(&self, key: &CacheKey) -> PathBuf {
        let (prefix, rest) = key.shard();
        self.deps_dir().join(prefix).join(format!("{rest}.json"))
    }

    /// Atomic write: unique temp file in the destination directory, then
    /// rename onto the final path.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let parent = path.parent().expect("cache paths always have a parent");
        let failure = |source| CacheError::WriteFailure {
            path: path.to_path_buf(),
            source,
        };
        fs::create_dir_all(parent).map_err(failure)?;
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(failure)?;
        temp.write_all(bytes).map_err(failure)?;
        temp.persist(path).map_err(|e| failure(e.error))?;
        Ok(())
    }

    /// Fail-safe read: missing is a miss, unreadable is a logged miss.
    fn read_optional(&self, path: &Path) -> Option<Vec<u8>> {
        match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    // --- object tier ---

    pub fn get_object(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.read_optional(&self.tier_path(CacheTier::Objects, key))
    }

    pub fn put_object(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), CacheError> {
        self.write_atomic(&self.tier_path(CacheTier::Objects, key), bytes)
    }

    // --- artifact tier ---

    pub fn get_artifact(&self, key: &CacheKey) -> Option<ArtifactBundle> {
        let path = self.tier_path(CacheTier::Artifacts, key);
        let bytes = self.read_optional(&path)?;
        // Probe the archive before handing it out; purge when unreadable.
        let mut probe = tar::Archive::new(bytes.as_slice());
        match probe.entries() {
            Ok(mut entries) => {
                if entries.any(|e| e.is_err()) {
                    self.purge_corrupt(&path);
                    return None;
                }
            }
            Err(_) => {
                self.purge_corrupt(&path);
                return None;
            }
        }
        Some(ArtifactBundle { bytes })
    }

    /// Bundle `files` (relative bundle path, absolute source path) into a tar
    /// and store it under `key`.
    pub fn put_artifact(
        &self,
        key: &CacheKey,
        files: &[(PathBuf, PathBuf)],
    ) -> Result<(), CacheError> {
        let mut builder = tar::Builder::new(Vec::new());
        for (bundle_path, source_path) in files {
            let mut file = File::open(source_path).map_err(|source| CacheError::ReadFailure {
                path: source_path.clone(),
                source,
            })?;
            builder
                .append_file(bundle_path, &mut file)
                .map_err(|source| CacheError::WriteFailure {
                    path: source_path.clone(),
                    source,
                })?;
        }
        let bytes = builder
            .into_inner()
            .map_err(|source| CacheError::WriteFailure {
                path: self.artifacts_dir(),
                source,
            })?;
        self.write_atomic(&self.tier_path(CacheTier::Artifacts, key), &bytes)
    }

    fn purge_corrupt(&self, path: &Path) {
        warn!(path = %path.display(), "purging corrupt cache entry");
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to purge corrupt entry");
        }
    }

    // --- header-discovery records ---

    /// Headers a translation unit was observed to include, keyed by its
    /// compile base key. Promotes later builds to the accurate object key.
    pub fn get_header_record(&self, base: &CacheKey) -> Option<Vec<PathBuf>> {
        let path = self.dep_record_path(base);
        let bytes = self.read_optional(&path)?;
        match serde_json::from_slice(&bytes) {
            Ok(headers) => Some(headers),
            Err(_) => {
                self.purge_corrupt(&path);
                None
            }
        }
    }

    pub fn put_header_record(
        &self,
        base: &CacheKey,
        headers: &[PathBuf],
    ) -> Result<(), CacheError> {
        let path = self.dep_record_path(base);
        let bytes = serde_json::to_vec(headers).expect("paths serialize");
        self.write_atomic(&path, &bytes)
    }

    // --- package store ---

    pub fn package_dir(&self, name: &str, version_label: &str) -> PathBuf {
        // `@org/name` nests one level deeper, mirroring the name shape.
        self.packages_dir().join(name).join(version_label)
    }

    /// Extract a fetched gzipped tarball into `packages/<name>/<label>/`.
    ///
    /// Extraction happens in a scratch directory renamed into place, so two
    /// builds materializing the same package race benignly.
    pub fn materialize_package(
        &self,
        name: &str,
        version_label: &str,
        archive_bytes: &[u8],
    ) -> Result<PathBuf, CacheError> {
        let dest = self.package_dir(name, version_label);
        if dest.is_dir() {
            debug!(package = name, label = version_label, "package already materialized");
            return Ok(dest);
        }

        let parent = dest.parent().expect("package dirs have a parent");
        let failure = |path: &Path, source| CacheError::WriteFailure {
            path: path.to_path_buf(),
            source,
        };
        fs::create_dir_all(parent).map_err(|e| failure(parent, e))?;
        let scratch =
            tempfile::tempdir_in(self.packages_dir()).map_err(|e| failure(parent, e))?;

        let gz = flate2::read::GzDecoder::new(archive_bytes);
        let mut archive = tar::Archive::new(gz);
        archive
            .unpack(scratch.path())
            .map_err(|_| CacheError::CorruptEntry {
                path: dest.clone(),
            })?;

        // After a successful rename the scratch path is gone; the TempDir
        // drop handler's cleanup becomes a no-op.
        match fs::rename(scratch.path(), &dest) {
            Ok(()) => Ok(dest),
            Err(_) if dest.is_dir() => Ok(dest),
            Err(source) => Err(failure(&dest, source)),
        }
    }

    // --- enumeration, eviction, index ---

    pub fn enumerate(&self, filter: Option<CacheTier>) -> Vec<CacheEntry> {
        let mut entries = Vec::new();
        for tier in [CacheTier::Objects, CacheTier::Artifacts] {
            if filter.is_some() && filter != Some(tier) {
                continue;
            }
            let dir = match tier {
                CacheTier::Objects => self.objects_dir(),
                CacheTier::Artifacts => self.artifacts_dir(),
            };
            let shards = match fs::read_dir(&dir) {
                Ok(shards) => shards,
                Err(_) => continue,
            };
            for shard in shards.flatten() {
                let prefix = shard.file_name().to_string_lossy().into_owned();
                let files = match fs::read_dir(shard.path()) {
                    Ok(files) => files,
                    Err(_) => continue,
                };
                for file in files.flatten() {
                    let file_name = file.file_name().to_string_lossy().into_owned();
                    let rest = match file_name.split_once('.') {
                        Some((rest, _ext)) => rest.to_string(),
                        None => continue,
                    };
                    let Ok(key) = CacheKey::from_hex(&format!("{prefix}{rest}")) else {
                        continue;
                    };
                    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
                    entries.push(CacheEntry { tier, key, size });
                }
            }
        }
        entries.sort_by_key(|e| e.key);
        entries
    }

    /// Remove entries matching `predicate`. Requires the exclusive process
    /// lock on the cache root; returns the number of entries removed.
    pub fn evict(&self, predicate: impl Fn(&CacheEntry) -> bool) -> Result<usize, CacheError> {
        let _lock = CacheLock::acquire(&self.root)?;
        let mut removed = 0;
        for entry in self.enumerate(None) {
            if predicate(&entry) {
                let path = self.tier_path(entry.tier, &entry.key);
                fs::remove_file(&path).map_err(|source| CacheError::WriteFailure {
                    path,
                    source,
                })?;
                removed += 1;
            }
        }
        self.update_index()?;
        Ok(removed)
    }

    pub fn load_index(&self) -> Option<CacheIndex> {
        let path = self.root.join("index.json");
        let bytes = self.read_optional(&path)?;
        match serde_json::from_slice(&bytes) {
            Ok(index) => Some(index),
            Err(_) => {
                self.purge_corrupt(&path);
                None
            }
        }
    }

    pub fn update_index(&self) -> Result<(), CacheError> {
        let packages = fs::read_dir(self.packages_dir())
            .map(|dir| dir.flatten().filter(|e| e.path().is_dir()).count())
            .unwrap_or(0);
        let index = CacheIndex {
            format_version: CACHE_FORMAT_VERSION,
            objects: self.enumerate(Some(CacheTier::Objects)).len(),
            artifacts: self.enumerate(Some(CacheTier::Artifacts)).len(),
            packages,
        };
        let bytes = serde_json::to_vec_pretty(&index).expect("index serializes");
        self.write_atomic(&self.root.join("index.json"), &bytes)
    }
}

/// Exclusive advisory lock on the cache root, held for destructive
/// operations only. Released on drop.
struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    fn acquire(root: &Path) -> Result<Self, CacheError> {
        let path = root.join(".lock");
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(CacheError::Locked { path })
            }
            Err(source) => Err(CacheError::WriteFailure { path, source }),
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
